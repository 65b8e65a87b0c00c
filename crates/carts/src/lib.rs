//! Cart domain module.
//!
//! A cart is not stored as such: it is the set of [`CartLine`]s sharing a cart
//! id. This crate holds the line type, the upsert rule and the derived
//! [`CartSnapshot`] (no IO, no storage).

pub mod line;

pub use line::{AddSeat, CartLine, CartLineKey, CartSnapshot, cart_total};
