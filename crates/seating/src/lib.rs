//! Seat Registry domain module.
//!
//! Seats are venue reference data with one mutable attribute: their
//! [`SeatState`]. This crate defines the legal state transitions as pure,
//! deterministic logic (no IO, no storage).

pub mod seat;

pub use seat::{Seat, SeatRef, SeatState, SeatStatus};
