use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use boxoffice_core::{CartId, Entity, Expected, Money, PaymentId};
use boxoffice_payments::{Payment, PaymentStatus};
use boxoffice_seating::SeatRef;

use super::StoreError;

/// Payment records, one per successful booking.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Record a new `NoPayment` payment for `cart_id` covering `seats`.
    async fn create(
        &self,
        cart_id: CartId,
        amount: Money,
        seats: Vec<SeatRef>,
    ) -> Result<Payment, StoreError>;

    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError>;

    /// Payments recorded for a cart, oldest first.
    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<Payment>, StoreError>;

    /// Move a payment to `next`.
    ///
    /// With `Expected::Exact` this is a compare-and-set on the current status;
    /// `Expected::Any` still refuses illegal lifecycle transitions.
    async fn update_status(
        &self,
        payment_id: PaymentId,
        expected: Expected<PaymentStatus>,
        next: PaymentStatus,
    ) -> Result<Payment, StoreError>;
}

#[async_trait]
impl<S> PaymentLedger for Arc<S>
where
    S: PaymentLedger + ?Sized,
{
    async fn create(
        &self,
        cart_id: CartId,
        amount: Money,
        seats: Vec<SeatRef>,
    ) -> Result<Payment, StoreError> {
        (**self).create(cart_id, amount, seats).await
    }

    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        (**self).get(payment_id).await
    }

    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<Payment>, StoreError> {
        (**self).list_by_cart(cart_id).await
    }

    async fn update_status(
        &self,
        payment_id: PaymentId,
        expected: Expected<PaymentStatus>,
        next: PaymentStatus,
    ) -> Result<Payment, StoreError> {
        (**self).update_status(payment_id, expected, next).await
    }
}

#[derive(Debug, Default)]
struct LedgerIndex {
    payments: HashMap<PaymentId, Payment>,
    by_cart: HashMap<CartId, Vec<PaymentId>>,
}

/// In-memory payment ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPaymentLedger {
    inner: RwLock<LedgerIndex>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of payment records (all carts).
    pub fn len(&self) -> Result<usize, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.payments.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn create(
        &self,
        cart_id: CartId,
        amount: Money,
        seats: Vec<SeatRef>,
    ) -> Result<Payment, StoreError> {
        let payment = Payment::open(cart_id, amount, seats, Utc::now());

        let mut index = self.inner.write().map_err(|_| StoreError::poisoned())?;
        index
            .by_cart
            .entry(cart_id)
            .or_default()
            .push(payment.id());
        index.payments.insert(payment.id(), payment.clone());
        Ok(payment)
    }

    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.payments.get(&payment_id).cloned())
    }

    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<Payment>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(index
            .by_cart
            .get(&cart_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.payments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_status(
        &self,
        payment_id: PaymentId,
        expected: Expected<PaymentStatus>,
        next: PaymentStatus,
    ) -> Result<Payment, StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let payment = index
            .payments
            .get_mut(&payment_id)
            .ok_or(StoreError::PaymentNotFound(payment_id))?;

        if !expected.matches(&payment.status()) {
            return Err(StoreError::PaymentConflict {
                payment: payment_id,
                found: payment.status(),
            });
        }

        payment.transition(next, Utc::now())?;
        Ok(payment.clone())
    }
}
