use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{CartId, DomainError, DomainResult, Entity, Money, PaymentId};
use boxoffice_seating::SeatRef;

/// Payment status lifecycle.
///
/// `NoPayment` is the state a booking creates; the payment-processing
/// collaborator later settles it as `Completed` or `Failed`. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NoPayment,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::NoPayment => "no_payment",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "no_payment" => Ok(PaymentStatus::NoPayment),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(DomainError::validation(format!("unknown payment status '{other}'"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::NoPayment)
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::NoPayment, PaymentStatus::Completed | PaymentStatus::Failed)
        )
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payment record per successful booking.
///
/// `amount` is a snapshot of the cart total at booking time; later price changes
/// do not touch it. `seats` are the seats this booking moved to `Booked`; a cart
/// booked more than once has disjoint seat sets per payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    id: PaymentId,
    cart_id: CartId,
    amount: Money,
    seats: Vec<SeatRef>,
    status: PaymentStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Payment {
    /// A new, unsettled payment for `cart_id`.
    pub fn open(cart_id: CartId, amount: Money, seats: Vec<SeatRef>, at: DateTime<Utc>) -> Self {
        Self {
            id: PaymentId::new(),
            cart_id,
            amount,
            seats,
            status: PaymentStatus::NoPayment,
            created_at: at,
            updated_at: at,
        }
    }

    /// Rehydrate a payment from storage.
    pub fn restore(
        id: PaymentId,
        cart_id: CartId,
        amount: Money,
        seats: Vec<SeatRef>,
        status: PaymentStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            cart_id,
            amount,
            seats,
            status,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn cart_id(&self) -> CartId {
        self.cart_id
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    /// Seats booked under this payment.
    pub fn seats(&self) -> &[SeatRef] {
        &self.seats
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn transition(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "illegal payment transition {} -> {next}",
                self.status
            )));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> Self::Id {
        self.id
    }
}
