//! Payment Ledger domain module.
//!
//! Business rules for payment records: creation at booking time and the
//! `NoPayment -> Completed | Failed` lifecycle (no IO, no storage).

pub mod payment;

pub use payment::{Payment, PaymentStatus};
