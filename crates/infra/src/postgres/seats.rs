use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use boxoffice_core::{CartId, EventId, SeatId, SectionId};
use boxoffice_seating::{Seat, SeatRef, SeatState, SeatStatus};

use super::{decode_error, map_sqlx_error, non_negative};
use crate::store::{SeatRegistry, StoreError};

const SEAT_COLUMNS: &str = "event_id, seat_id, section_id, row_number, seat_number, \
                            status, holder_cart_id, version, updated_at";

/// Seat registry over the `seats` table.
///
/// `transition_status` is one conditional `UPDATE`: the row changes only if its
/// status and holder still equal the expectation, so concurrent callers across
/// processes serialize on the row lock and exactly one wins.
#[derive(Debug, Clone)]
pub struct PostgresSeatRegistry {
    pool: PgPool,
}

impl PostgresSeatRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load or refresh venue reference data. Existing seat state is kept.
    #[instrument(skip(self, seat), fields(seat = %seat.seat_ref()), err)]
    pub async fn publish(&self, seat: &Seat) -> Result<(), StoreError> {
        let row_number = to_column("row_number", seat.row_number)?;
        let seat_number = to_column("seat_number", seat.seat_number)?;

        sqlx::query(
            r#"
            INSERT INTO seats (event_id, seat_id, section_id, row_number, seat_number)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id, seat_id)
            DO UPDATE SET
                section_id = EXCLUDED.section_id,
                row_number = EXCLUDED.row_number,
                seat_number = EXCLUDED.seat_number
            "#,
        )
        .bind(seat.seat.event_id.get())
        .bind(seat.seat.seat_id.get())
        .bind(seat.section_id.get())
        .bind(row_number)
        .bind(seat_number)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("publish_seat", e))?;
        Ok(())
    }

    async fn fetch_one(&self, seat: SeatRef) -> Result<Option<Seat>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE event_id = $1 AND seat_id = $2"
        ))
        .bind(seat.event_id.get())
        .bind(seat.seat_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_seat", e))?;

        row.as_ref().map(seat_from_row).transpose()
    }
}

#[async_trait]
impl SeatRegistry for PostgresSeatRegistry {
    #[instrument(skip(self, seats), fields(requested = seats.len(), found = field::Empty), err)]
    async fn get_by_refs(&self, seats: &[SeatRef]) -> Result<Vec<Seat>, StoreError> {
        if seats.is_empty() {
            return Ok(Vec::new());
        }

        let event_ids: Vec<i64> = seats.iter().map(|s| s.event_id.get()).collect();
        let seat_ids: Vec<i64> = seats.iter().map(|s| s.seat_id.get()).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SEAT_COLUMNS}
            FROM seats
            WHERE (event_id, seat_id) IN (
                SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[])
            )
            "#
        ))
        .bind(event_ids)
        .bind(seat_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_refs", e))?;

        let mut by_ref = HashMap::with_capacity(rows.len());
        for row in &rows {
            let seat = seat_from_row(row)?;
            by_ref.insert(seat.seat_ref(), seat);
        }

        // Request order, each seat once.
        let found: Vec<Seat> = seats.iter().filter_map(|r| by_ref.remove(r)).collect();
        Span::current().record("found", found.len());
        Ok(found)
    }

    #[instrument(
        skip(self),
        fields(seat = %seat, expected = %expected, next = %next),
        err
    )]
    async fn transition_status(
        &self,
        seat: SeatRef,
        expected: SeatState,
        next: SeatState,
    ) -> Result<Seat, StoreError> {
        expected.ensure_transition(&next)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE seats
            SET status = $5,
                holder_cart_id = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE event_id = $1
              AND seat_id = $2
              AND status = $3
              AND holder_cart_id IS NOT DISTINCT FROM $4
            RETURNING {SEAT_COLUMNS}
            "#
        ))
        .bind(seat.event_id.get())
        .bind(seat.seat_id.get())
        .bind(expected.status().as_str())
        .bind(expected.holder().map(|c| *c.as_uuid()))
        .bind(next.status().as_str())
        .bind(next.holder().map(|c| *c.as_uuid()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_status", e))?;

        if let Some(row) = row {
            return seat_from_row(&row);
        }

        // Nothing matched: tell a missing seat from a lost race.
        match self.fetch_one(seat).await? {
            None => Err(StoreError::SeatNotFound(seat)),
            Some(current) => Err(StoreError::SeatConflict {
                seat,
                expected,
                found: current.state(),
            }),
        }
    }

    #[instrument(skip(self), fields(cart_id = %cart_id), err)]
    async fn list_held_by(&self, cart_id: CartId) -> Result<Vec<Seat>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE holder_cart_id = $1 ORDER BY event_id, seat_id"
        ))
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_held_by", e))?;

        rows.iter().map(seat_from_row).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id, section_id = %section_id), err)]
    async fn list_section(
        &self,
        event_id: EventId,
        section_id: SectionId,
    ) -> Result<Vec<Seat>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SEAT_COLUMNS}
            FROM seats
            WHERE event_id = $1 AND section_id = $2
            ORDER BY row_number, seat_number
            "#
        ))
        .bind(event_id.get())
        .bind(section_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_section", e))?;

        rows.iter().map(seat_from_row).collect()
    }
}

fn to_column(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Invariant(format!("column {column} out of range: {value}")))
}

fn seat_from_row(row: &PgRow) -> Result<Seat, StoreError> {
    let get_i64 = |column: &str| -> Result<i64, StoreError> {
        row.try_get::<i64, _>(column)
            .map_err(|e| decode_error("seat", e))
    };
    let get_i32 = |column: &str| -> Result<i32, StoreError> {
        row.try_get::<i32, _>(column)
            .map_err(|e| decode_error("seat", e))
    };

    let status: String = row.try_get("status").map_err(|e| decode_error("seat", e))?;
    let holder: Option<Uuid> = row
        .try_get("holder_cart_id")
        .map_err(|e| decode_error("seat", e))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| decode_error("seat", e))?;

    let state = SeatState::from_parts(
        SeatStatus::parse(&status)?,
        holder.map(CartId::from_uuid),
    )?;

    Ok(Seat::restore(
        SeatRef::new(
            EventId::new(get_i64("event_id")?),
            SeatId::new(get_i64("seat_id")?),
        ),
        SectionId::new(get_i64("section_id")?),
        non_negative("row_number", i64::from(get_i32("row_number")?))?,
        non_negative("seat_number", i64::from(get_i32("seat_number")?))?,
        state,
        non_negative("version", get_i64("version")?)?,
        updated_at,
    ))
}
