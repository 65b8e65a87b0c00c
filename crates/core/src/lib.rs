//! `boxoffice-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod concurrency;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;

pub use concurrency::Expected;
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{CartId, EventId, OrderId, PaymentId, PriceTierId, SeatId, SectionId};
pub use money::Money;
