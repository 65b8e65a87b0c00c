//! Infrastructure layer: stores, the reservation coordinator, config and wiring.
//!
//! Domain crates stay IO-free; everything that touches storage lives here.

pub mod config;
pub mod coordinator;
pub mod postgres;
pub mod services;
pub mod store;

pub use config::{ConfigError, ReservationConfig, StorageBackend};
pub use coordinator::{BookingOutcome, BookingReceipt, ReservationCoordinator, ReservationError};
pub use services::{ReservationServices, SharedCoordinator};
pub use store::StoreError;
