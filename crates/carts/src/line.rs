use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{
    CartId, DomainError, DomainResult, Entity, EventId, Money, PriceTierId, SeatId,
};
use boxoffice_seating::SeatRef;

/// Composite identity of a cart line. At most one line exists per key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CartLineKey {
    pub cart_id: CartId,
    pub event_id: EventId,
    pub seat_id: SeatId,
}

impl CartLineKey {
    pub const fn new(cart_id: CartId, event_id: EventId, seat_id: SeatId) -> Self {
        Self {
            cart_id,
            event_id,
            seat_id,
        }
    }

    pub const fn seat_ref(&self) -> SeatRef {
        SeatRef::new(self.event_id, self.seat_id)
    }
}

/// Input: put a seat into a cart at a given tier and price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSeat {
    pub event_id: EventId,
    pub seat_id: SeatId,
    pub price_tier_id: PriceTierId,
    pub price: Money,
}

impl AddSeat {
    pub fn seat_ref(&self) -> SeatRef {
        SeatRef::new(self.event_id, self.seat_id)
    }
}

/// One seat selection in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub cart_id: CartId,
    pub event_id: EventId,
    pub seat_id: SeatId,
    pub price_tier_id: PriceTierId,
    pub price: Money,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartLine {
    pub fn new(cart_id: CartId, add: &AddSeat, at: DateTime<Utc>) -> Self {
        Self {
            cart_id,
            event_id: add.event_id,
            seat_id: add.seat_id,
            price_tier_id: add.price_tier_id,
            price: add.price,
            added_at: at,
            updated_at: at,
        }
    }

    pub fn key(&self) -> CartLineKey {
        CartLineKey::new(self.cart_id, self.event_id, self.seat_id)
    }

    pub fn seat_ref(&self) -> SeatRef {
        SeatRef::new(self.event_id, self.seat_id)
    }

    /// The stored line with the tier and price of `add` applied.
    ///
    /// Identity and `added_at` come from `self`; everything the caller asked to
    /// change comes from `add`. The result is what must be persisted.
    pub fn repriced(&self, add: &AddSeat, at: DateTime<Utc>) -> DomainResult<Self> {
        if add.event_id != self.event_id || add.seat_id != self.seat_id {
            return Err(DomainError::invariant(format!(
                "cannot reprice line for {} with input for {}",
                self.seat_ref(),
                add.seat_ref()
            )));
        }
        Ok(Self {
            price_tier_id: add.price_tier_id,
            price: add.price,
            updated_at: at,
            ..self.clone()
        })
    }
}

impl Entity for CartLine {
    type Id = CartLineKey;

    fn id(&self) -> Self::Id {
        self.key()
    }
}

/// Sum of line prices.
pub fn cart_total(lines: &[CartLine]) -> DomainResult<Money> {
    Money::sum(lines.iter().map(|l| l.price))
}

/// Derived view of a cart: its id and the total of its current lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub cart_id: CartId,
    pub total_amount: Money,
    pub line_count: usize,
}

impl CartSnapshot {
    /// Build the snapshot, verifying the lines really form one well-keyed cart.
    pub fn from_lines(cart_id: CartId, lines: &[CartLine]) -> DomainResult<Self> {
        let mut seen = HashSet::with_capacity(lines.len());
        for line in lines {
            if line.cart_id != cart_id {
                return Err(DomainError::invariant(format!(
                    "line for cart {} listed under cart {cart_id}",
                    line.cart_id
                )));
            }
            if !seen.insert(line.id()) {
                return Err(DomainError::invariant(format!(
                    "duplicate line for {} in cart {cart_id}",
                    line.seat_ref()
                )));
            }
        }

        Ok(Self {
            cart_id,
            total_amount: cart_total(lines)?,
            line_count: lines.len(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }
}
