//! Persistence collaborator boundary.
//!
//! One narrow trait per store, each with an in-memory implementation for
//! tests/dev. PostgreSQL implementations live in [`crate::postgres`]. The
//! coordinator only ever talks to these traits.

pub mod cart_store;
pub mod order_directory;
pub mod payment_ledger;
pub mod seat_registry;

use thiserror::Error;

use boxoffice_core::{DomainError, PaymentId};
use boxoffice_payments::PaymentStatus;
use boxoffice_seating::{SeatRef, SeatState};

pub use cart_store::{CartStore, InMemoryCartStore};
pub use order_directory::{InMemoryOrderDirectory, OrderDirectory};
pub use payment_ledger::{InMemoryPaymentLedger, PaymentLedger};
pub use seat_registry::{InMemorySeatRegistry, SeatRegistry};

/// Store operation error.
///
/// `SeatNotFound` means the seat does not exist; `SeatConflict` means a
/// compare-and-set found a different state than expected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("seat not found: {0}")]
    SeatNotFound(SeatRef),

    #[error("seat {seat} changed concurrently (expected {expected}, found {found})")]
    SeatConflict {
        seat: SeatRef,
        expected: SeatState,
        found: SeatState,
    },

    #[error("payment not found: {0}")]
    PaymentNotFound(PaymentId),

    #[error("payment {payment} changed concurrently (found {found})")]
    PaymentConflict {
        payment: PaymentId,
        found: PaymentStatus,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        StoreError::Storage("lock poisoned".to_string())
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvariantViolation(msg) | DomainError::Validation(msg) => {
                StoreError::Invariant(msg)
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}
