//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Seats, cart lines and payments are entities: a line repriced twice is still the
/// same line, keyed by `(cart, event, seat)`.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}
