use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use boxoffice_core::{CartId, EventId, SectionId};
use boxoffice_seating::{Seat, SeatRef, SeatState};

use super::StoreError;

/// Authoritative seat state.
///
/// `transition_status` is the single synchronization point for seat ownership:
/// it succeeds only when the stored state equals `expected`, and it is atomic at
/// the storage layer, so two callers racing for one seat cannot both win.
#[async_trait]
pub trait SeatRegistry: Send + Sync {
    /// Read-only snapshot of the requested seats, in request order.
    ///
    /// Unknown seats are omitted; duplicates in `seats` are returned once.
    async fn get_by_refs(&self, seats: &[SeatRef]) -> Result<Vec<Seat>, StoreError>;

    /// Compare-and-set the seat's state.
    ///
    /// Fails with `SeatNotFound` for unknown seats, `SeatConflict` when the stored
    /// state differs from `expected`, and `Invariant` for an illegal transition.
    async fn transition_status(
        &self,
        seat: SeatRef,
        expected: SeatState,
        next: SeatState,
    ) -> Result<Seat, StoreError>;

    /// Seats currently held or booked by `cart_id`.
    async fn list_held_by(&self, cart_id: CartId) -> Result<Vec<Seat>, StoreError>;

    /// Seats of one section, ordered by row then seat number.
    async fn list_section(
        &self,
        event_id: EventId,
        section_id: SectionId,
    ) -> Result<Vec<Seat>, StoreError>;
}

#[async_trait]
impl<S> SeatRegistry for Arc<S>
where
    S: SeatRegistry + ?Sized,
{
    async fn get_by_refs(&self, seats: &[SeatRef]) -> Result<Vec<Seat>, StoreError> {
        (**self).get_by_refs(seats).await
    }

    async fn transition_status(
        &self,
        seat: SeatRef,
        expected: SeatState,
        next: SeatState,
    ) -> Result<Seat, StoreError> {
        (**self).transition_status(seat, expected, next).await
    }

    async fn list_held_by(&self, cart_id: CartId) -> Result<Vec<Seat>, StoreError> {
        (**self).list_held_by(cart_id).await
    }

    async fn list_section(
        &self,
        event_id: EventId,
        section_id: SectionId,
    ) -> Result<Vec<Seat>, StoreError> {
        (**self).list_section(event_id, section_id).await
    }
}

#[derive(Debug, Default)]
struct SeatIndex {
    seats: HashMap<SeatRef, Seat>,
    by_holder: HashMap<CartId, BTreeSet<SeatRef>>,
    by_section: HashMap<(EventId, SectionId), BTreeSet<SeatRef>>,
}

impl SeatIndex {
    fn unlink_holder(&mut self, seat: SeatRef, holder: Option<CartId>) {
        if let Some(cart_id) = holder {
            if let Some(held) = self.by_holder.get_mut(&cart_id) {
                held.remove(&seat);
                if held.is_empty() {
                    self.by_holder.remove(&cart_id);
                }
            }
        }
    }

    fn link_holder(&mut self, seat: SeatRef, holder: Option<CartId>) {
        if let Some(cart_id) = holder {
            self.by_holder.entry(cart_id).or_default().insert(seat);
        }
    }

    fn snapshot(&self, refs: impl IntoIterator<Item = SeatRef>) -> Vec<Seat> {
        refs.into_iter()
            .filter_map(|r| self.seats.get(&r).cloned())
            .collect()
    }
}

/// In-memory seat registry.
///
/// Intended for tests/dev. The compare-and-set runs under one write lock, which
/// is the in-process equivalent of a conditional row update.
#[derive(Debug, Default)]
pub struct InMemorySeatRegistry {
    inner: RwLock<SeatIndex>,
}

impl InMemorySeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seats(seats: impl IntoIterator<Item = Seat>) -> Result<Self, StoreError> {
        let registry = Self::new();
        for seat in seats {
            registry.register(seat)?;
        }
        Ok(registry)
    }

    /// Load venue reference data. Replaces any seat with the same address.
    pub fn register(&self, seat: Seat) -> Result<(), StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let seat_ref = seat.seat_ref();

        if let Some(previous) = index.seats.remove(&seat_ref) {
            index.unlink_holder(seat_ref, previous.state().holder());
            if let Some(section) = index
                .by_section
                .get_mut(&(seat_ref.event_id, previous.section_id))
            {
                section.remove(&seat_ref);
            }
        }

        index.link_holder(seat_ref, seat.state().holder());
        index
            .by_section
            .entry((seat_ref.event_id, seat.section_id))
            .or_default()
            .insert(seat_ref);
        index.seats.insert(seat_ref, seat);
        Ok(())
    }
}

#[async_trait]
impl SeatRegistry for InMemorySeatRegistry {
    async fn get_by_refs(&self, seats: &[SeatRef]) -> Result<Vec<Seat>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let mut seen = HashSet::with_capacity(seats.len());
        let unique = seats.iter().copied().filter(|r| seen.insert(*r));
        Ok(index.snapshot(unique))
    }

    async fn transition_status(
        &self,
        seat: SeatRef,
        expected: SeatState,
        next: SeatState,
    ) -> Result<Seat, StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::poisoned())?;

        let stored = index
            .seats
            .get_mut(&seat)
            .ok_or(StoreError::SeatNotFound(seat))?;

        let found = stored.state();
        if found != expected {
            return Err(StoreError::SeatConflict {
                seat,
                expected,
                found,
            });
        }

        stored.transition(next, Utc::now())?;
        let updated = stored.clone();

        index.unlink_holder(seat, found.holder());
        index.link_holder(seat, next.holder());
        Ok(updated)
    }

    async fn list_held_by(&self, cart_id: CartId) -> Result<Vec<Seat>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let refs = index
            .by_holder
            .get(&cart_id)
            .map(|held| held.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(index.snapshot(refs))
    }

    async fn list_section(
        &self,
        event_id: EventId,
        section_id: SectionId,
    ) -> Result<Vec<Seat>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let refs = index
            .by_section
            .get(&(event_id, section_id))
            .map(|section| section.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();

        let mut seats = index.snapshot(refs);
        seats.sort_by_key(|s| (s.row_number, s.seat_number));
        Ok(seats)
    }
}
