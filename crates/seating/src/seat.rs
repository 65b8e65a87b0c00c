use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{CartId, DomainError, DomainResult, Entity, EventId, SeatId, SectionId};

/// Seat address as carried by cart lines: a seat within an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeatRef {
    pub event_id: EventId,
    pub seat_id: SeatId,
}

impl SeatRef {
    pub const fn new(event_id: EventId, seat_id: SeatId) -> Self {
        Self { event_id, seat_id }
    }
}

impl core::fmt::Display for SeatRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "event {} seat {}", self.event_id, self.seat_id)
    }
}

/// Seat status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Available,
    Held,
    Booked,
}

impl SeatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Held => "held",
            SeatStatus::Booked => "booked",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "available" => Ok(SeatStatus::Available),
            "held" => Ok(SeatStatus::Held),
            "booked" => Ok(SeatStatus::Booked),
            other => Err(DomainError::validation(format!("unknown seat status '{other}'"))),
        }
    }
}

impl core::fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the cart holding the seat.
///
/// `Held` and `Booked` always name their cart; `Available` never does. The pair is
/// the value compared by the registry's compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeatState {
    status: SeatStatus,
    holder: Option<CartId>,
}

impl SeatState {
    pub const fn available() -> Self {
        Self {
            status: SeatStatus::Available,
            holder: None,
        }
    }

    pub const fn held_by(cart_id: CartId) -> Self {
        Self {
            status: SeatStatus::Held,
            holder: Some(cart_id),
        }
    }

    pub const fn booked_by(cart_id: CartId) -> Self {
        Self {
            status: SeatStatus::Booked,
            holder: Some(cart_id),
        }
    }

    /// Rebuild a state from stored columns, rejecting inconsistent pairs.
    pub fn from_parts(status: SeatStatus, holder: Option<CartId>) -> DomainResult<Self> {
        match (status, holder) {
            (SeatStatus::Available, None) => Ok(Self::available()),
            (SeatStatus::Held, Some(cart_id)) => Ok(Self::held_by(cart_id)),
            (SeatStatus::Booked, Some(cart_id)) => Ok(Self::booked_by(cart_id)),
            (status, holder) => Err(DomainError::invariant(format!(
                "seat status {status} inconsistent with holder {holder:?}"
            ))),
        }
    }

    pub fn status(&self) -> SeatStatus {
        self.status
    }

    pub fn holder(&self) -> Option<CartId> {
        self.holder
    }

    pub fn is_held_by(&self, cart_id: CartId) -> bool {
        self.holder == Some(cart_id)
    }

    /// Whether `cart_id` may move this seat to `Booked`.
    ///
    /// Add-to-cart takes no hold, so contention surfaces here: a seat is bookable
    /// when nobody holds it, or when the booking cart already holds it.
    pub fn is_bookable_by(&self, cart_id: CartId) -> bool {
        match self.status {
            SeatStatus::Available => true,
            SeatStatus::Held => self.is_held_by(cart_id),
            SeatStatus::Booked => false,
        }
    }

    pub fn can_transition_to(&self, next: &SeatState) -> bool {
        match (self.status, next.status) {
            (SeatStatus::Available, SeatStatus::Held | SeatStatus::Booked) => true,
            (SeatStatus::Held, SeatStatus::Booked) | (SeatStatus::Booked, SeatStatus::Held) => {
                self.holder == next.holder
            }
            (SeatStatus::Held | SeatStatus::Booked, SeatStatus::Available) => true,
            _ => false,
        }
    }

    pub fn ensure_transition(&self, next: &SeatState) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "illegal seat transition {self} -> {next}"
            )))
        }
    }
}

impl Default for SeatState {
    fn default() -> Self {
        Self::available()
    }
}

impl core::fmt::Display for SeatState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.holder {
            Some(cart_id) => write!(f, "{}({})", self.status, cart_id),
            None => write!(f, "{}", self.status),
        }
    }
}

/// A seat in the registry. Venue attributes are reference data; only `state`
/// changes, and only through the reservation coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub seat: SeatRef,
    pub section_id: SectionId,
    pub row_number: u32,
    pub seat_number: u32,
    state: SeatState,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl Seat {
    /// A freshly published, available seat.
    pub fn new(seat: SeatRef, section_id: SectionId, row_number: u32, seat_number: u32) -> Self {
        Self {
            seat,
            section_id,
            row_number,
            seat_number,
            state: SeatState::available(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Rehydrate a seat from storage.
    pub fn restore(
        seat: SeatRef,
        section_id: SectionId,
        row_number: u32,
        seat_number: u32,
        state: SeatState,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seat,
            section_id,
            row_number,
            seat_number,
            state,
            version,
            updated_at,
        }
    }

    pub fn seat_ref(&self) -> SeatRef {
        self.seat
    }

    pub fn state(&self) -> SeatState {
        self.state
    }

    pub fn status(&self) -> SeatStatus {
        self.state.status()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Move to `next` if the transition is legal. Bumps the version.
    ///
    /// This is the in-process half of the registry's compare-and-set; the caller
    /// has already verified the current state matches its expectation.
    pub fn transition(&mut self, next: SeatState, at: DateTime<Utc>) -> DomainResult<()> {
        self.state.ensure_transition(&next)?;
        self.state = next;
        self.version += 1;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for Seat {
    type Id = SeatRef;

    fn id(&self) -> Self::Id {
        self.seat
    }
}
