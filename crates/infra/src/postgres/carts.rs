use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use boxoffice_carts::{CartLine, CartLineKey};
use boxoffice_core::{CartId, EventId, Money, PriceTierId, SeatId};

use super::{decode_error, map_sqlx_error};
use crate::store::{CartStore, StoreError};

const LINE_COLUMNS: &str =
    "cart_id, event_id, seat_id, price_tier_id, price_cents, added_at, updated_at";

/// Cart store over the `cart_lines` table.
///
/// The primary key is the line's composite key, so an upsert can never
/// produce a second row for the same seat. `position` keeps insertion order
/// across updates.
#[derive(Debug, Clone)]
pub struct PostgresCartStore {
    pool: PgPool,
}

impl PostgresCartStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CartStore for PostgresCartStore {
    #[instrument(skip(self, line), fields(cart_id = %line.cart_id, seat = %line.seat_ref()), err)]
    async fn upsert(&self, line: CartLine) -> Result<CartLine, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO cart_lines (
                cart_id, event_id, seat_id, price_tier_id, price_cents, added_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (cart_id, event_id, seat_id)
            DO UPDATE SET
                price_tier_id = EXCLUDED.price_tier_id,
                price_cents = EXCLUDED.price_cents,
                updated_at = EXCLUDED.updated_at
            RETURNING {LINE_COLUMNS}
            "#
        ))
        .bind(line.cart_id.as_uuid())
        .bind(line.event_id.get())
        .bind(line.seat_id.get())
        .bind(line.price_tier_id.get())
        .bind(line.price.to_minor()?)
        .bind(line.added_at)
        .bind(line.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_line", e))?;

        line_from_row(&row)
    }

    #[instrument(skip(self), fields(cart_id = %key.cart_id), err)]
    async fn find_line(&self, key: CartLineKey) -> Result<Option<CartLine>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM cart_lines
            WHERE cart_id = $1 AND event_id = $2 AND seat_id = $3
            "#
        ))
        .bind(key.cart_id.as_uuid())
        .bind(key.event_id.get())
        .bind(key.seat_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_line", e))?;

        row.as_ref().map(line_from_row).transpose()
    }

    #[instrument(skip(self), fields(cart_id = %cart_id, line_count = field::Empty), err)]
    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINE_COLUMNS} FROM cart_lines WHERE cart_id = $1 ORDER BY position"
        ))
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_cart", e))?;

        Span::current().record("line_count", rows.len());
        rows.iter().map(line_from_row).collect()
    }

    #[instrument(skip(self), fields(cart_id = %key.cart_id), err)]
    async fn delete_line(&self, key: CartLineKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM cart_lines WHERE cart_id = $1 AND event_id = $2 AND seat_id = $3",
        )
        .bind(key.cart_id.as_uuid())
        .bind(key.event_id.get())
        .bind(key.seat_id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_line", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(cart_id = %cart_id), err)]
    async fn delete_all_for_cart(&self, cart_id: CartId) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cart_lines WHERE cart_id = $1")
            .bind(cart_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_all_for_cart", e))?;

        Ok(result.rows_affected() as usize)
    }
}

fn line_from_row(row: &PgRow) -> Result<CartLine, StoreError> {
    let cart_id: Uuid = row.try_get("cart_id").map_err(|e| decode_error("cart line", e))?;
    let event_id: i64 = row.try_get("event_id").map_err(|e| decode_error("cart line", e))?;
    let seat_id: i64 = row.try_get("seat_id").map_err(|e| decode_error("cart line", e))?;
    let price_tier_id: i64 = row
        .try_get("price_tier_id")
        .map_err(|e| decode_error("cart line", e))?;
    let price_cents: i64 = row
        .try_get("price_cents")
        .map_err(|e| decode_error("cart line", e))?;
    let added_at: DateTime<Utc> = row
        .try_get("added_at")
        .map_err(|e| decode_error("cart line", e))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| decode_error("cart line", e))?;

    Ok(CartLine {
        cart_id: CartId::from_uuid(cart_id),
        event_id: EventId::new(event_id),
        seat_id: SeatId::new(seat_id),
        price_tier_id: PriceTierId::new(price_tier_id),
        price: Money::from_minor(price_cents)?,
        added_at,
        updated_at,
    })
}
