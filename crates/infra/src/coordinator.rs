//! Reservation coordinator.
//!
//! The only component allowed to move a seat out of `Available`. It ties the
//! seat registry, cart store and payment ledger together so that a booking is
//! observed either completely (seats `Booked`, one `NoPayment` payment, cart
//! cleared) or not at all.
//!
//! The stores are independent, so cross-store atomicity is provided by
//! compensation: every seat transitioned by a failed call is moved back to the
//! exact state it was taken from. Contention between carts is resolved solely by
//! the registry's compare-and-set.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, error, field, info, instrument, warn};

use boxoffice_carts::{AddSeat, CartLine, CartLineKey, CartSnapshot};
use boxoffice_core::{
    CartId, DomainError, EventId, Expected, Money, OrderId, PaymentId, SeatId, SectionId,
};
use boxoffice_payments::{Payment, PaymentStatus};
use boxoffice_seating::{Seat, SeatRef, SeatState};

use crate::store::{CartStore, OrderDirectory, PaymentLedger, SeatRegistry, StoreError};

/// Failure of a coordinator call.
///
/// "Nothing to do" is never an error; see [`BookingOutcome::NothingToBook`] and
/// the `bool` results of the release/delete operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReservationError {
    #[error("seat not found: {0}")]
    SeatNotFound(SeatRef),

    /// The listed seats are held or booked by another cart, or changed while
    /// this call was running.
    #[error("seats no longer available: {seats:?}")]
    SeatConflict { seats: Vec<SeatRef> },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for ReservationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SeatNotFound(seat) => ReservationError::SeatNotFound(seat),
            StoreError::SeatConflict { seat, .. } => {
                ReservationError::SeatConflict { seats: vec![seat] }
            }
            StoreError::Invariant(msg) => ReservationError::InvariantViolation(msg),
            StoreError::Storage(msg) => ReservationError::Storage(msg),
            other @ (StoreError::PaymentNotFound(_) | StoreError::PaymentConflict { .. }) => {
                ReservationError::InvariantViolation(other.to_string())
            }
        }
    }
}

impl From<DomainError> for ReservationError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvariantViolation(msg) => ReservationError::InvariantViolation(msg),
            other => ReservationError::InvariantViolation(other.to_string()),
        }
    }
}

/// What a successful booking produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingReceipt {
    pub payment_id: PaymentId,
    pub cart_id: CartId,
    pub amount: Money,
    pub seats: Vec<SeatRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BookingOutcome {
    Booked(BookingReceipt),
    /// The cart was empty, or none of its lines referenced a known seat.
    NothingToBook,
}

impl BookingOutcome {
    /// The booking identifier, if anything was booked.
    pub fn payment_id(&self) -> Option<PaymentId> {
        match self {
            BookingOutcome::Booked(receipt) => Some(receipt.payment_id),
            BookingOutcome::NothingToBook => None,
        }
    }

    pub fn is_booked(&self) -> bool {
        matches!(self, BookingOutcome::Booked(_))
    }
}

/// Seat moved by the current call, with the state it was taken from.
#[derive(Debug, Clone, Copy)]
struct Transitioned {
    seat: SeatRef,
    prior: SeatState,
}

pub struct ReservationCoordinator<R, C, P, O> {
    seats: R,
    carts: C,
    payments: P,
    orders: O,
}

impl<R, C, P, O> ReservationCoordinator<R, C, P, O>
where
    R: SeatRegistry,
    C: CartStore,
    P: PaymentLedger,
    O: OrderDirectory,
{
    pub fn new(seats: R, carts: C, payments: P, orders: O) -> Self {
        Self {
            seats,
            carts,
            payments,
            orders,
        }
    }

    pub fn seats(&self) -> &R {
        &self.seats
    }

    pub fn carts(&self) -> &C {
        &self.carts
    }

    pub fn payments(&self) -> &P {
        &self.payments
    }

    pub fn orders(&self) -> &O {
        &self.orders
    }

    /// Put a seat into a cart, or reprice the line already there.
    ///
    /// Takes no hold: contention is resolved when the cart is booked. The
    /// returned total reflects the cart after the upsert.
    #[instrument(
        skip(self, add),
        fields(
            cart_id = %cart_id,
            event_id = %add.event_id,
            seat_id = %add.seat_id,
            price = %add.price
        ),
        err
    )]
    pub async fn add_seat_to_cart(
        &self,
        cart_id: CartId,
        add: AddSeat,
    ) -> Result<CartSnapshot, ReservationError> {
        let seat_ref = add.seat_ref();
        if self.seats.get_by_refs(&[seat_ref]).await?.is_empty() {
            warn!(seat = %seat_ref, "rejecting cart line for unknown seat");
            return Err(ReservationError::SeatNotFound(seat_ref));
        }

        let now = Utc::now();
        let key = CartLineKey::new(cart_id, add.event_id, add.seat_id);
        let previous = self.carts.find_line(key).await?;
        let line = match &previous {
            Some(existing) => existing.repriced(&add, now)?,
            None => CartLine::new(cart_id, &add, now),
        };

        // The cart as it will look after the write; nothing is stored unless it holds.
        let mut pending = self.carts.list_by_cart(cart_id).await?;
        match pending.iter_mut().find(|l| l.key() == key) {
            Some(slot) => *slot = line.clone(),
            None => pending.push(line.clone()),
        }
        CartSnapshot::from_lines(cart_id, &pending).inspect_err(|err| {
            error!(error = %err, "cart inconsistent before upsert; line not stored");
        })?;

        self.carts.upsert(line).await?;

        let lines = self.carts.list_by_cart(cart_id).await?;
        match CartSnapshot::from_lines(cart_id, &lines) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                error!(error = %err, "cart inconsistent after upsert; reverting line");
                self.revert_line(key, previous).await;
                Err(err.into())
            }
        }
    }

    /// Put back the line an upsert replaced, or remove the one it created.
    async fn revert_line(&self, key: CartLineKey, previous: Option<CartLine>) {
        let reverted = match previous {
            Some(line) => self.carts.upsert(line).await.map(|_| ()),
            None => self.carts.delete_line(key).await.map(|_| ()),
        };
        if let Err(err) = reverted {
            error!(error = %err, "cart line could not be reverted");
        }
    }

    /// Book every seat referenced by the cart and record one payment for it.
    ///
    /// Seats must be `Available` or already held by this cart. Any conflict
    /// fails the whole call and leaves seats, cart and ledger as they were.
    /// Lines for unknown seats are skipped.
    #[instrument(
        skip(self),
        fields(
            cart_id = %cart_id,
            payment_id = field::Empty,
            seat_count = field::Empty
        ),
        err
    )]
    pub async fn book_cart(&self, cart_id: CartId) -> Result<BookingOutcome, ReservationError> {
        let lines = self.carts.list_by_cart(cart_id).await?;
        if lines.is_empty() {
            info!("cart is empty; nothing to book");
            return Ok(BookingOutcome::NothingToBook);
        }

        let snapshot = CartSnapshot::from_lines(cart_id, &lines)?;
        let refs: Vec<SeatRef> = lines.iter().map(CartLine::seat_ref).collect();
        let seats = self.seats.get_by_refs(&refs).await?;
        if seats.is_empty() {
            warn!(lines = lines.len(), "no cart line references a known seat");
            return Ok(BookingOutcome::NothingToBook);
        }
        if seats.len() < refs.len() {
            let known: Vec<SeatRef> = seats.iter().map(Seat::seat_ref).collect();
            let unknown: Vec<String> = refs
                .iter()
                .filter(|r| !known.contains(r))
                .map(ToString::to_string)
                .collect();
            warn!(?unknown, "skipping cart lines for unknown seats");
        }

        let contested: Vec<SeatRef> = seats
            .iter()
            .filter(|s| !s.state().is_bookable_by(cart_id))
            .map(Seat::seat_ref)
            .collect();
        if !contested.is_empty() {
            warn!(?contested, "seats held by another cart");
            return Err(ReservationError::SeatConflict { seats: contested });
        }

        let booked_state = SeatState::booked_by(cart_id);
        let mut transitioned = Vec::with_capacity(seats.len());
        for seat in &seats {
            let prior = seat.state();
            match self
                .seats
                .transition_status(seat.seat_ref(), prior, booked_state)
                .await
            {
                Ok(_) => transitioned.push(Transitioned {
                    seat: seat.seat_ref(),
                    prior,
                }),
                Err(err) => {
                    warn!(seat = %seat.seat_ref(), error = %err, "seat transition failed; rolling back booking");
                    self.compensate(cart_id, &transitioned).await?;
                    return Err(err.into());
                }
            }
        }

        let booked: Vec<SeatRef> = transitioned.iter().map(|t| t.seat).collect();
        let payment = match self
            .payments
            .create(cart_id, snapshot.total_amount, booked.clone())
            .await
        {
            Ok(payment) => payment,
            Err(err) => {
                warn!(error = %err, "payment creation failed; rolling back booking");
                self.compensate(cart_id, &transitioned).await?;
                return Err(err.into());
            }
        };

        if let Err(err) = self.carts.delete_all_for_cart(cart_id).await {
            warn!(error = %err, "booked cart lines could not be cleared");
        }

        let span = Span::current();
        span.record("payment_id", field::display(payment.id_typed()));
        span.record("seat_count", transitioned.len());
        info!(amount = %payment.amount(), "cart booked");

        Ok(BookingOutcome::Booked(BookingReceipt {
            payment_id: payment.id_typed(),
            cart_id,
            amount: payment.amount(),
            seats: booked,
        }))
    }

    /// Move seats this call booked back to their prior state, newest first.
    ///
    /// Every seat is attempted. Seats that could not be restored stay `Booked`
    /// without a payment and are named in the returned `InvariantViolation`.
    async fn compensate(
        &self,
        cart_id: CartId,
        transitioned: &[Transitioned],
    ) -> Result<(), ReservationError> {
        let booked_state = SeatState::booked_by(cart_id);
        let mut stuck = Vec::new();
        for t in transitioned.iter().rev() {
            match self
                .seats
                .transition_status(t.seat, booked_state, t.prior)
                .await
            {
                Ok(_) => warn!(seat = %t.seat, restored = %t.prior, "seat booking compensated"),
                Err(err) => {
                    error!(seat = %t.seat, error = %err, "seat compensation failed");
                    stuck.push(t.seat);
                }
            }
        }

        if stuck.is_empty() {
            return Ok(());
        }
        stuck.reverse();
        let seats: Vec<String> = stuck.iter().map(ToString::to_string).collect();
        Err(ReservationError::InvariantViolation(format!(
            "compensation failed; seats left booked without payment: {}",
            seats.join(", ")
        )))
    }

    /// Remove a line from a cart. Leaves the seat untouched.
    #[instrument(
        skip(self),
        fields(cart_id = %cart_id, event_id = %event_id, seat_id = %seat_id),
        err
    )]
    pub async fn delete_seat_for_cart(
        &self,
        cart_id: CartId,
        event_id: EventId,
        seat_id: SeatId,
    ) -> Result<bool, ReservationError> {
        let removed = self
            .carts
            .delete_line(CartLineKey::new(cart_id, event_id, seat_id))
            .await?;
        if !removed {
            info!("no matching cart line");
        }
        Ok(removed)
    }

    /// Lines of the cart in insertion order.
    #[instrument(skip(self), fields(cart_id = %cart_id), err)]
    pub async fn cart_items(&self, cart_id: CartId) -> Result<Vec<CartLine>, ReservationError> {
        Ok(self.carts.list_by_cart(cart_id).await?)
    }

    /// Return every seat the cart holds or has booked to `Available` and clear
    /// its lines. Returns the number of seats released.
    ///
    /// Pending payments of the cart are failed first, so none can complete
    /// against released seats. A seat that changed hands concurrently is left
    /// alone.
    #[instrument(skip(self), fields(cart_id = %cart_id, released = field::Empty), err)]
    pub async fn release_cart(&self, cart_id: CartId) -> Result<usize, ReservationError> {
        let voided = self.fail_pending_payments(cart_id).await?;
        let released = self.release_held(cart_id).await?;
        let cleared = self.carts.delete_all_for_cart(cart_id).await?;

        Span::current().record("released", released);
        info!(lines = cleared, payments_failed = voided, "cart released");
        Ok(released)
    }

    /// Release every cart belonging to `order_id`.
    ///
    /// `false` when the order is unknown or has no carts.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn release_carts_from_order(
        &self,
        order_id: OrderId,
    ) -> Result<bool, ReservationError> {
        let carts = match self.orders.carts_for_order(order_id).await? {
            Some(carts) if !carts.is_empty() => carts,
            _ => {
                warn!("order has no carts to release");
                return Ok(false);
            }
        };

        let mut released = 0;
        for cart_id in &carts {
            released += self.release_cart(*cart_id).await?;
        }
        info!(carts = carts.len(), seats = released, "order released");
        Ok(true)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    pub async fn payment_status(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<Payment>, ReservationError> {
        Ok(self.payments.get(payment_id).await?)
    }

    /// Payments recorded for a cart, oldest first.
    #[instrument(skip(self), fields(cart_id = %cart_id), err)]
    pub async fn payments_for_cart(
        &self,
        cart_id: CartId,
    ) -> Result<Vec<Payment>, ReservationError> {
        Ok(self.payments.list_by_cart(cart_id).await?)
    }

    /// Settle a pending payment. Seats stay `Booked`.
    ///
    /// `false` when the payment is unknown or already settled.
    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    pub async fn complete_payment(&self, payment_id: PaymentId) -> Result<bool, ReservationError> {
        Ok(self
            .settle(payment_id, PaymentStatus::Completed)
            .await?
            .is_some())
    }

    /// Mark a pending payment failed and free the seats it booked.
    ///
    /// Seats booked by other payments of the same cart are untouched. `false`
    /// when the payment is unknown or already settled.
    #[instrument(skip(self), fields(payment_id = %payment_id, released = field::Empty), err)]
    pub async fn fail_payment(&self, payment_id: PaymentId) -> Result<bool, ReservationError> {
        let Some(payment) = self.settle(payment_id, PaymentStatus::Failed).await? else {
            return Ok(false);
        };

        let released = self
            .release_booked(payment.cart_id(), payment.seats())
            .await?;
        Span::current().record("released", released);
        info!(cart_id = %payment.cart_id(), "seats released after failed payment");
        Ok(true)
    }

    /// Seat map of one section, ordered by row then seat number.
    #[instrument(skip(self), fields(event_id = %event_id, section_id = %section_id), err)]
    pub async fn section_seats(
        &self,
        event_id: EventId,
        section_id: SectionId,
    ) -> Result<Vec<Seat>, ReservationError> {
        Ok(self.seats.list_section(event_id, section_id).await?)
    }

    async fn settle(
        &self,
        payment_id: PaymentId,
        next: PaymentStatus,
    ) -> Result<Option<Payment>, ReservationError> {
        match self
            .payments
            .update_status(payment_id, Expected::Exact(PaymentStatus::NoPayment), next)
            .await
        {
            Ok(payment) => {
                info!(status = %next, cart_id = %payment.cart_id(), "payment settled");
                Ok(Some(payment))
            }
            Err(StoreError::PaymentNotFound(_)) => {
                warn!("payment not found");
                Ok(None)
            }
            Err(StoreError::PaymentConflict { found, .. }) => {
                warn!(%found, requested = %next, "payment already settled");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fail every `NoPayment` payment of the cart. Payments settled in the
    /// meantime are skipped.
    async fn fail_pending_payments(&self, cart_id: CartId) -> Result<usize, ReservationError> {
        let mut failed = 0;
        for payment in self.payments.list_by_cart(cart_id).await? {
            if payment.status() != PaymentStatus::NoPayment {
                continue;
            }
            if self
                .settle(payment.id_typed(), PaymentStatus::Failed)
                .await?
                .is_some()
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Compare-and-set every seat held or booked by `cart_id` back to
    /// `Available`.
    async fn release_held(&self, cart_id: CartId) -> Result<usize, ReservationError> {
        let held = self.seats.list_held_by(cart_id).await?;

        let mut released = 0;
        for seat in &held {
            if self.release_one(seat.seat_ref(), seat.state()).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Compare-and-set the given seats from `Booked(cart_id)` back to
    /// `Available`.
    async fn release_booked(
        &self,
        cart_id: CartId,
        seats: &[SeatRef],
    ) -> Result<usize, ReservationError> {
        let booked = SeatState::booked_by(cart_id);

        let mut released = 0;
        for seat in seats {
            if self.release_one(*seat, booked).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// `false` when the seat is gone or no longer in `expected`.
    async fn release_one(
        &self,
        seat: SeatRef,
        expected: SeatState,
    ) -> Result<bool, ReservationError> {
        match self
            .seats
            .transition_status(seat, expected, SeatState::available())
            .await
        {
            Ok(_) => Ok(true),
            Err(err @ (StoreError::SeatConflict { .. } | StoreError::SeatNotFound(_))) => {
                warn!(seat = %seat, error = %err, "seat changed before release; skipping");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use boxoffice_core::PriceTierId;
    use boxoffice_seating::SeatStatus;
    use proptest::prelude::*;

    use super::*;
    use crate::store::{
        InMemoryCartStore, InMemoryOrderDirectory, InMemoryPaymentLedger, InMemorySeatRegistry,
    };

    type TestCoordinator = ReservationCoordinator<
        Arc<dyn SeatRegistry>,
        Arc<InMemoryCartStore>,
        Arc<dyn PaymentLedger>,
        Arc<InMemoryOrderDirectory>,
    >;

    const EVENT: EventId = EventId::new(1);

    fn seat_ref(seat: i64) -> SeatRef {
        SeatRef::new(EVENT, SeatId::new(seat))
    }

    fn test_registry(seats: i64) -> Arc<InMemorySeatRegistry> {
        let registry = InMemorySeatRegistry::with_seats((1..=seats).map(|n| {
            Seat::new(seat_ref(n), SectionId::new(1), 1, n as u32)
        }))
        .unwrap();
        Arc::new(registry)
    }

    struct Harness {
        registry: Arc<InMemorySeatRegistry>,
        ledger: Arc<InMemoryPaymentLedger>,
        coordinator: TestCoordinator,
    }

    fn harness_with(
        registry: Arc<dyn SeatRegistry>,
        inner: Arc<InMemorySeatRegistry>,
        ledger: Arc<dyn PaymentLedger>,
        memory_ledger: Arc<InMemoryPaymentLedger>,
    ) -> Harness {
        Harness {
            registry: inner,
            ledger: memory_ledger,
            coordinator: ReservationCoordinator::new(
                registry,
                Arc::new(InMemoryCartStore::new()),
                ledger,
                Arc::new(InMemoryOrderDirectory::new()),
            ),
        }
    }

    fn harness(seats: i64) -> Harness {
        let registry = test_registry(seats);
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        harness_with(registry.clone(), registry, ledger.clone(), ledger)
    }

    fn add(seat: i64, cents: u64) -> AddSeat {
        AddSeat {
            event_id: EVENT,
            seat_id: SeatId::new(seat),
            price_tier_id: PriceTierId::new(1),
            price: Money::from_cents(cents),
        }
    }

    async fn state_of(registry: &InMemorySeatRegistry, seat: i64) -> SeatState {
        registry.get_by_refs(&[seat_ref(seat)]).await.unwrap()[0].state()
    }

    /// Fails transitions on one seat with a storage error. With
    /// `only_from_booked` set, only transitions out of `Booked` fail.
    struct FlakyRegistry {
        inner: Arc<InMemorySeatRegistry>,
        broken: SeatRef,
        only_from_booked: bool,
    }

    #[async_trait]
    impl SeatRegistry for FlakyRegistry {
        async fn get_by_refs(&self, seats: &[SeatRef]) -> Result<Vec<Seat>, StoreError> {
            self.inner.get_by_refs(seats).await
        }

        async fn transition_status(
            &self,
            seat: SeatRef,
            expected: SeatState,
            next: SeatState,
        ) -> Result<Seat, StoreError> {
            let from_booked = expected.status() == SeatStatus::Booked;
            if seat == self.broken && (from_booked || !self.only_from_booked) {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.inner.transition_status(seat, expected, next).await
        }

        async fn list_held_by(&self, cart_id: CartId) -> Result<Vec<Seat>, StoreError> {
            self.inner.list_held_by(cart_id).await
        }

        async fn list_section(
            &self,
            event_id: EventId,
            section_id: SectionId,
        ) -> Result<Vec<Seat>, StoreError> {
            self.inner.list_section(event_id, section_id).await
        }
    }

    /// Refuses to create payments.
    struct FailingLedger {
        inner: Arc<InMemoryPaymentLedger>,
    }

    #[async_trait]
    impl PaymentLedger for FailingLedger {
        async fn create(
            &self,
            _cart_id: CartId,
            _amount: Money,
            _seats: Vec<SeatRef>,
        ) -> Result<Payment, StoreError> {
            Err(StoreError::Storage("ledger unavailable".to_string()))
        }

        async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
            self.inner.get(payment_id).await
        }

        async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<Payment>, StoreError> {
            self.inner.list_by_cart(cart_id).await
        }

        async fn update_status(
            &self,
            payment_id: PaymentId,
            expected: Expected<PaymentStatus>,
            next: PaymentStatus,
        ) -> Result<Payment, StoreError> {
            self.inner.update_status(payment_id, expected, next).await
        }
    }

    /// Lists the line for one seat twice, like a store without its key constraint.
    struct DuplicatingCartStore {
        inner: InMemoryCartStore,
        doubled: SeatRef,
    }

    #[async_trait]
    impl CartStore for DuplicatingCartStore {
        async fn upsert(&self, line: CartLine) -> Result<CartLine, StoreError> {
            self.inner.upsert(line).await
        }

        async fn find_line(&self, key: CartLineKey) -> Result<Option<CartLine>, StoreError> {
            self.inner.find_line(key).await
        }

        async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
            let mut lines = self.inner.list_by_cart(cart_id).await?;
            if let Some(line) = lines.iter().find(|l| l.seat_ref() == self.doubled).cloned() {
                lines.push(line);
            }
            Ok(lines)
        }

        async fn delete_line(&self, key: CartLineKey) -> Result<bool, StoreError> {
            self.inner.delete_line(key).await
        }

        async fn delete_all_for_cart(&self, cart_id: CartId) -> Result<usize, StoreError> {
            self.inner.delete_all_for_cart(cart_id).await
        }
    }

    #[tokio::test]
    async fn repeated_add_overwrites_price_and_total() {
        let h = harness(2);
        let cart_id = CartId::new();

        h.coordinator.add_seat_to_cart(cart_id, add(1, 1000)).await.unwrap();
        let first = h.coordinator.cart_items(cart_id).await.unwrap()[0].clone();
        let snapshot = h.coordinator.add_seat_to_cart(cart_id, add(1, 1200)).await.unwrap();

        assert_eq!(snapshot.total_amount, Money::from_cents(1200));
        assert_eq!(snapshot.line_count, 1);

        let lines = h.coordinator.cart_items(cart_id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].price, Money::from_cents(1200));
        assert_eq!(lines[0].added_at, first.added_at);
    }

    #[tokio::test]
    async fn add_reports_total_after_upsert() {
        let h = harness(2);
        let cart_id = CartId::new();

        h.coordinator.add_seat_to_cart(cart_id, add(1, 1000)).await.unwrap();
        let snapshot = h.coordinator.add_seat_to_cart(cart_id, add(2, 1550)).await.unwrap();
        assert_eq!(snapshot.total_amount.to_string(), "25.50");
        assert_eq!(snapshot.line_count, 2);
    }

    #[tokio::test]
    async fn add_takes_no_hold() {
        let h = harness(1);
        h.coordinator.add_seat_to_cart(CartId::new(), add(1, 100)).await.unwrap();
        assert_eq!(state_of(&h.registry, 1).await, SeatState::available());
    }

    #[tokio::test]
    async fn add_unknown_seat_fails_without_a_line() {
        let h = harness(1);
        let cart_id = CartId::new();

        let err = h.coordinator.add_seat_to_cart(cart_id, add(9, 100)).await.unwrap_err();
        assert_eq!(err, ReservationError::SeatNotFound(seat_ref(9)));
        assert!(h.coordinator.cart_items(cart_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_cart_books_nothing() {
        let h = harness(1);
        let outcome = h.coordinator.book_cart(CartId::new()).await.unwrap();
        assert_eq!(outcome, BookingOutcome::NothingToBook);
        assert_eq!(outcome.payment_id(), None);
        assert!(h.ledger.is_empty().unwrap());
    }

    #[tokio::test]
    async fn cart_of_unknown_seats_books_nothing() {
        let h = harness(1);
        let cart_id = CartId::new();
        h.coordinator
            .carts()
            .upsert(CartLine::new(cart_id, &add(7, 500), Utc::now()))
            .await
            .unwrap();

        let outcome = h.coordinator.book_cart(cart_id).await.unwrap();
        assert_eq!(outcome, BookingOutcome::NothingToBook);
        assert!(h.ledger.is_empty().unwrap());
        assert_eq!(h.coordinator.cart_items(cart_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn booking_snapshots_amount_and_clears_cart() {
        let h = harness(2);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 1000)).await.unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(2, 1550)).await.unwrap();

        let BookingOutcome::Booked(receipt) = h.coordinator.book_cart(cart_id).await.unwrap() else {
            panic!("Expected a booking");
        };
        assert_eq!(receipt.amount.to_string(), "25.50");
        assert_eq!(receipt.seats, vec![seat_ref(1), seat_ref(2)]);

        let payment = h.coordinator.payment_status(receipt.payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status(), PaymentStatus::NoPayment);
        assert_eq!(payment.cart_id(), cart_id);
        assert_eq!(payment.amount(), Money::from_cents(2550));

        for seat in [1, 2] {
            assert_eq!(state_of(&h.registry, seat).await, SeatState::booked_by(cart_id));
        }
        assert!(h.coordinator.cart_items(cart_id).await.unwrap().is_empty());

        // Re-pricing the seat in another cart does not touch the recorded amount.
        h.coordinator.add_seat_to_cart(CartId::new(), add(1, 9999)).await.unwrap();
        let payment = h.coordinator.payment_status(receipt.payment_id).await.unwrap().unwrap();
        assert_eq!(payment.amount(), Money::from_cents(2550));
    }

    #[tokio::test]
    async fn unknown_lines_are_skipped_but_priced() {
        let h = harness(1);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 1000)).await.unwrap();
        h.coordinator
            .carts()
            .upsert(CartLine::new(cart_id, &add(8, 500), Utc::now()))
            .await
            .unwrap();

        let BookingOutcome::Booked(receipt) = h.coordinator.book_cart(cart_id).await.unwrap() else {
            panic!("Expected a booking");
        };
        assert_eq!(receipt.seats, vec![seat_ref(1)]);
        assert_eq!(receipt.amount, Money::from_cents(1500));
    }

    #[tokio::test]
    async fn seat_booked_by_another_cart_is_a_conflict() {
        let h = harness(2);
        let winner = CartId::new();
        let loser = CartId::new();
        h.coordinator.add_seat_to_cart(winner, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(loser, add(2, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(loser, add(1, 100)).await.unwrap();
        h.coordinator.book_cart(winner).await.unwrap();

        let err = h.coordinator.book_cart(loser).await.unwrap_err();
        assert_eq!(err, ReservationError::SeatConflict { seats: vec![seat_ref(1)] });

        assert_eq!(state_of(&h.registry, 2).await, SeatState::available());
        assert_eq!(h.coordinator.cart_items(loser).await.unwrap().len(), 2);
        assert!(h.coordinator.payments_for_cart(loser).await.unwrap().is_empty());
        assert_eq!(h.ledger.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn seat_held_by_the_cart_is_bookable() {
        let h = harness(1);
        let owner = CartId::new();
        h.registry
            .transition_status(seat_ref(1), SeatState::available(), SeatState::held_by(owner))
            .await
            .unwrap();

        let other = CartId::new();
        h.coordinator.add_seat_to_cart(other, add(1, 100)).await.unwrap();
        assert!(matches!(
            h.coordinator.book_cart(other).await.unwrap_err(),
            ReservationError::SeatConflict { .. }
        ));

        h.coordinator.add_seat_to_cart(owner, add(1, 100)).await.unwrap();
        assert!(h.coordinator.book_cart(owner).await.unwrap().is_booked());
        assert_eq!(state_of(&h.registry, 1).await, SeatState::booked_by(owner));
    }

    #[tokio::test]
    async fn failed_transition_rolls_back_earlier_seats() {
        let inner = test_registry(3);
        let cart_id = CartId::new();
        inner
            .transition_status(seat_ref(2), SeatState::available(), SeatState::held_by(cart_id))
            .await
            .unwrap();
        let flaky: Arc<dyn SeatRegistry> = Arc::new(FlakyRegistry {
            inner: inner.clone(),
            broken: seat_ref(3),
            only_from_booked: false,
        });
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        let h = harness_with(flaky, inner, ledger.clone(), ledger);

        for seat in [1, 2, 3] {
            h.coordinator.add_seat_to_cart(cart_id, add(seat, 100)).await.unwrap();
        }

        let err = h.coordinator.book_cart(cart_id).await.unwrap_err();
        assert!(matches!(err, ReservationError::Storage(_)));

        assert_eq!(state_of(&h.registry, 1).await, SeatState::available());
        assert_eq!(state_of(&h.registry, 2).await, SeatState::held_by(cart_id));
        assert_eq!(state_of(&h.registry, 3).await, SeatState::available());
        assert!(h.ledger.is_empty().unwrap());
        assert_eq!(h.coordinator.cart_items(cart_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn payment_failure_rolls_back_seats() {
        let registry = test_registry(2);
        let memory_ledger = Arc::new(InMemoryPaymentLedger::new());
        let failing: Arc<dyn PaymentLedger> = Arc::new(FailingLedger {
            inner: memory_ledger.clone(),
        });
        let h = harness_with(registry.clone(), registry, failing, memory_ledger);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(2, 100)).await.unwrap();

        let err = h.coordinator.book_cart(cart_id).await.unwrap_err();
        assert_eq!(err, ReservationError::Storage("ledger unavailable".to_string()));
        for seat in [1, 2] {
            assert_eq!(state_of(&h.registry, seat).await, SeatState::available());
        }
        assert_eq!(h.coordinator.cart_items(cart_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_line_matched() {
        let h = harness(2);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(2, 200)).await.unwrap();

        assert!(!h
            .coordinator
            .delete_seat_for_cart(cart_id, EVENT, SeatId::new(5))
            .await
            .unwrap());
        assert_eq!(h.coordinator.cart_items(cart_id).await.unwrap().len(), 2);

        assert!(h
            .coordinator
            .delete_seat_for_cart(cart_id, EVENT, SeatId::new(1))
            .await
            .unwrap());
        let lines = h.coordinator.cart_items(cart_id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].seat_id, SeatId::new(2));
    }

    #[tokio::test]
    async fn releasing_an_order_frees_seats_and_clears_lines() {
        let h = harness(3);
        let booked = CartId::new();
        let pending = CartId::new();
        let order_id = OrderId::new(10);
        h.coordinator.orders().insert(order_id, [booked, pending]).unwrap();

        h.coordinator.add_seat_to_cart(booked, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(booked, add(2, 100)).await.unwrap();
        h.coordinator.book_cart(booked).await.unwrap();
        h.coordinator.add_seat_to_cart(pending, add(3, 100)).await.unwrap();

        assert!(h.coordinator.release_carts_from_order(order_id).await.unwrap());

        for seat in [1, 2, 3] {
            assert_eq!(state_of(&h.registry, seat).await, SeatState::available());
        }
        assert!(h.coordinator.cart_items(booked).await.unwrap().is_empty());
        assert!(h.coordinator.cart_items(pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn releasing_unknown_or_empty_order_is_false() {
        let h = harness(1);
        assert!(!h.coordinator.release_carts_from_order(OrderId::new(1)).await.unwrap());

        h.coordinator.orders().insert(OrderId::new(2), Vec::new()).unwrap();
        assert!(!h.coordinator.release_carts_from_order(OrderId::new(2)).await.unwrap());
    }

    #[tokio::test]
    async fn release_leaves_other_carts_seats_alone() {
        let h = harness(2);
        let mine = CartId::new();
        let theirs = CartId::new();
        h.coordinator.add_seat_to_cart(mine, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(theirs, add(2, 100)).await.unwrap();
        h.coordinator.book_cart(mine).await.unwrap();
        h.coordinator.book_cart(theirs).await.unwrap();

        assert_eq!(h.coordinator.release_cart(mine).await.unwrap(), 1);
        assert_eq!(state_of(&h.registry, 1).await, SeatState::available());
        assert_eq!(state_of(&h.registry, 2).await, SeatState::booked_by(theirs));
    }

    #[tokio::test]
    async fn completing_a_payment_keeps_seats_booked() {
        let h = harness(1);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        let payment_id = h.coordinator.book_cart(cart_id).await.unwrap().payment_id().unwrap();

        assert!(h.coordinator.complete_payment(payment_id).await.unwrap());
        assert!(!h.coordinator.complete_payment(payment_id).await.unwrap());
        assert!(!h.coordinator.fail_payment(payment_id).await.unwrap());

        let payment = h.coordinator.payment_status(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status(), PaymentStatus::Completed);
        assert_eq!(state_of(&h.registry, 1).await, SeatState::booked_by(cart_id));
    }

    #[tokio::test]
    async fn failing_a_payment_frees_its_seats() {
        let h = harness(2);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(2, 100)).await.unwrap();
        let payment_id = h.coordinator.book_cart(cart_id).await.unwrap().payment_id().unwrap();

        assert!(h.coordinator.fail_payment(payment_id).await.unwrap());
        for seat in [1, 2] {
            assert_eq!(state_of(&h.registry, seat).await, SeatState::available());
        }
        let payments = h.coordinator.payments_for_cart(cart_id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status(), PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_payment_cannot_be_settled() {
        let h = harness(1);
        let unknown = PaymentId::new();
        assert!(!h.coordinator.complete_payment(unknown).await.unwrap());
        assert!(!h.coordinator.fail_payment(unknown).await.unwrap());
        assert!(h.coordinator.payment_status(unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inconsistent_cart_rejects_add_without_storing() {
        let carts = Arc::new(DuplicatingCartStore {
            inner: InMemoryCartStore::new(),
            doubled: seat_ref(2),
        });
        let coordinator = ReservationCoordinator::new(
            test_registry(2),
            carts.clone(),
            Arc::new(InMemoryPaymentLedger::new()),
            Arc::new(InMemoryOrderDirectory::new()),
        );
        let cart_id = CartId::new();
        coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();

        // The new line only shows up duplicated after the write, which is undone.
        let err = coordinator.add_seat_to_cart(cart_id, add(2, 200)).await.unwrap_err();
        assert!(matches!(err, ReservationError::InvariantViolation(msg) if msg.contains("duplicate")));
        let stored = carts.inner.list_by_cart(cart_id).await.unwrap();
        assert_eq!(
            stored.iter().map(CartLine::seat_ref).collect::<Vec<_>>(),
            vec![seat_ref(1)]
        );

        // An already inconsistent cart is refused before anything is written.
        carts
            .inner
            .upsert(CartLine::new(cart_id, &add(2, 200), Utc::now()))
            .await
            .unwrap();
        let err = coordinator.add_seat_to_cart(cart_id, add(2, 999)).await.unwrap_err();
        assert!(matches!(err, ReservationError::InvariantViolation(_)));
        let line = carts
            .inner
            .find_line(CartLineKey::new(cart_id, EVENT, SeatId::new(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.price, Money::from_cents(200));
    }

    #[tokio::test]
    async fn failed_compensation_names_the_seats_left_booked() {
        let inner = test_registry(2);
        let flaky: Arc<dyn SeatRegistry> = Arc::new(FlakyRegistry {
            inner: inner.clone(),
            broken: seat_ref(1),
            only_from_booked: true,
        });
        let memory_ledger = Arc::new(InMemoryPaymentLedger::new());
        let failing: Arc<dyn PaymentLedger> = Arc::new(FailingLedger {
            inner: memory_ledger.clone(),
        });
        let h = harness_with(flaky, inner, failing, memory_ledger);
        let cart_id = CartId::new();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(2, 100)).await.unwrap();

        match h.coordinator.book_cart(cart_id).await.unwrap_err() {
            ReservationError::InvariantViolation(msg) => {
                assert!(msg.contains("compensation failed"), "{msg}");
                assert!(msg.contains("event 1 seat 1"), "{msg}");
                assert!(!msg.contains("seat 2"), "{msg}");
            }
            other => panic!("Expected InvariantViolation, got {other:?}"),
        }
        assert_eq!(state_of(&h.registry, 1).await, SeatState::booked_by(cart_id));
        assert_eq!(state_of(&h.registry, 2).await, SeatState::available());
        assert!(h.ledger.is_empty().unwrap());
    }

    #[tokio::test]
    async fn failing_one_payment_keeps_the_carts_earlier_booking() {
        let h = harness(2);
        let cart_id = CartId::new();

        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        let first = h.coordinator.book_cart(cart_id).await.unwrap().payment_id().unwrap();
        assert!(h.coordinator.complete_payment(first).await.unwrap());

        h.coordinator.add_seat_to_cart(cart_id, add(2, 200)).await.unwrap();
        let second = h.coordinator.book_cart(cart_id).await.unwrap().payment_id().unwrap();
        let pending = h.coordinator.payment_status(second).await.unwrap().unwrap();
        assert_eq!(pending.seats(), &[seat_ref(2)]);

        assert!(h.coordinator.fail_payment(second).await.unwrap());
        assert_eq!(state_of(&h.registry, 1).await, SeatState::booked_by(cart_id));
        assert_eq!(state_of(&h.registry, 2).await, SeatState::available());

        let completed = h.coordinator.payment_status(first).await.unwrap().unwrap();
        assert_eq!(completed.status(), PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn releasing_an_order_fails_its_pending_payments() {
        let h = harness(1);
        let cart_id = CartId::new();
        let order_id = OrderId::new(7);
        h.coordinator.orders().insert(order_id, [cart_id]).unwrap();
        h.coordinator.add_seat_to_cart(cart_id, add(1, 100)).await.unwrap();
        let payment_id = h.coordinator.book_cart(cart_id).await.unwrap().payment_id().unwrap();

        assert!(h.coordinator.release_carts_from_order(order_id).await.unwrap());

        assert!(!h.coordinator.complete_payment(payment_id).await.unwrap());
        let payment = h.coordinator.payment_status(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert_eq!(state_of(&h.registry, 1).await, SeatState::available());
    }

    #[tokio::test]
    async fn section_seats_come_back_in_seat_order() {
        let h = harness(3);
        let seats = h.coordinator.section_seats(EVENT, SectionId::new(1)).await.unwrap();
        let numbers: Vec<u32> = seats.iter().map(|s| s.seat_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(h
            .coordinator
            .section_seats(EVENT, SectionId::new(9))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn receipt_serializes_with_outcome_tag() {
        let outcome = BookingOutcome::Booked(BookingReceipt {
            payment_id: PaymentId::new(),
            cart_id: CartId::new(),
            amount: Money::from_cents(2550),
            seats: vec![seat_ref(1)],
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "booked");
        assert_eq!(json["amount"], 2550);
        assert_eq!(json["seats"][0]["seat_id"], 1);

        let back: BookingOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
        assert_eq!(
            serde_json::to_value(BookingOutcome::NothingToBook).unwrap()["outcome"],
            "nothing_to_book"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: after any sequence of adds, the cart holds one line per seat
        /// in first-added order, each at its latest price, and the total is their sum.
        #[test]
        fn cart_reflects_latest_price_per_seat(
            adds in prop::collection::vec((1i64..=4, 0u64..10_000), 1..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let h = harness(4);
            let cart_id = CartId::new();

            let mut expected: Vec<(i64, u64)> = Vec::new();
            let mut last = None;
            for (seat, cents) in adds {
                last = Some(rt.block_on(h.coordinator.add_seat_to_cart(cart_id, add(seat, cents))).unwrap());
                match expected.iter_mut().find(|(s, _)| *s == seat) {
                    Some(entry) => entry.1 = cents,
                    None => expected.push((seat, cents)),
                }
            }

            let snapshot = last.unwrap();
            let total: u64 = expected.iter().map(|(_, c)| c).sum();
            prop_assert_eq!(snapshot.total_amount, Money::from_cents(total));
            prop_assert_eq!(snapshot.line_count, expected.len());

            let lines = rt.block_on(h.coordinator.cart_items(cart_id)).unwrap();
            let got: Vec<(i64, u64)> = lines.iter().map(|l| (l.seat_id.get(), l.price.cents())).collect();
            prop_assert_eq!(got, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bookings_of_one_seat_have_one_winner() {
        let registry = test_registry(1);
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        let h = harness_with(registry.clone(), registry, ledger.clone(), ledger);
        let coordinator = Arc::new(h.coordinator);

        let carts: Vec<CartId> = (0..16).map(|_| CartId::new()).collect();
        for cart_id in &carts {
            coordinator.add_seat_to_cart(*cart_id, add(1, 100)).await.unwrap();
        }

        let handles: Vec<_> = carts
            .iter()
            .map(|cart_id| {
                let coordinator = Arc::clone(&coordinator);
                let cart_id = *cart_id;
                tokio::spawn(async move { (cart_id, coordinator.book_cart(cart_id).await) })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                (cart_id, Ok(outcome)) => {
                    assert!(outcome.is_booked());
                    winners.push(cart_id);
                }
                (_, Err(err)) => assert_eq!(
                    err,
                    ReservationError::SeatConflict { seats: vec![seat_ref(1)] }
                ),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(state_of(&h.registry, 1).await, SeatState::booked_by(winners[0]));
        assert_eq!(h.ledger.len().unwrap(), 1);
        assert_eq!(coordinator.payments_for_cart(winners[0]).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn crossing_multi_seat_bookings_never_split_seats() {
        for _ in 0..32 {
            let registry = test_registry(3);
            let ledger = Arc::new(InMemoryPaymentLedger::new());
            let h = harness_with(registry.clone(), registry, ledger.clone(), ledger);
            let coordinator = Arc::new(h.coordinator);

            // Opposite seat order makes each cart grab a seat the other needs.
            let first = CartId::new();
            let second = CartId::new();
            for seat in [1, 2, 3] {
                coordinator.add_seat_to_cart(first, add(seat, 100)).await.unwrap();
            }
            for seat in [3, 2, 1] {
                coordinator.add_seat_to_cart(second, add(seat, 100)).await.unwrap();
            }

            let a = {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.book_cart(first).await })
            };
            let b = {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.book_cart(second).await })
            };
            let results = [(first, a.await.unwrap()), (second, b.await.unwrap())];

            let winners: Vec<CartId> = results
                .iter()
                .filter(|(_, r)| matches!(r, Ok(outcome) if outcome.is_booked()))
                .map(|(cart_id, _)| *cart_id)
                .collect();
            assert!(winners.len() <= 1);
            for (_, result) in &results {
                if let Err(err) = result {
                    assert!(matches!(err, ReservationError::SeatConflict { .. }));
                }
            }

            let mut holders = HashSet::new();
            for seat in [1, 2, 3] {
                let state = state_of(&h.registry, seat).await;
                match winners.first() {
                    Some(winner) => assert_eq!(state, SeatState::booked_by(*winner)),
                    None => assert_eq!(state, SeatState::available()),
                }
                holders.insert(state.holder());
            }
            assert_eq!(holders.len(), 1);
            assert_eq!(h.ledger.len().unwrap(), winners.len());
        }
    }
}
