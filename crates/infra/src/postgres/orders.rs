use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use boxoffice_core::{CartId, OrderId};

use super::{decode_error, map_sqlx_error};
use crate::store::{OrderDirectory, StoreError};

/// Order-to-cart mapping over the `order_carts` table.
///
/// Rows are written by the order subsystem; [`assign`](Self::assign) exists for
/// wiring and tests.
#[derive(Debug, Clone)]
pub struct PostgresOrderDirectory {
    pool: PgPool,
}

impl PostgresOrderDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), fields(order_id = %order_id, cart_id = %cart_id), err)]
    pub async fn assign(&self, order_id: OrderId, cart_id: CartId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO order_carts (order_id, cart_id)
            VALUES ($1, $2)
            ON CONFLICT (order_id, cart_id) DO NOTHING
            "#,
        )
        .bind(order_id.get())
        .bind(cart_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("assign_cart", e))?;
        Ok(())
    }
}

#[async_trait]
impl OrderDirectory for PostgresOrderDirectory {
    /// An order without rows is reported as unknown.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn carts_for_order(&self, order_id: OrderId) -> Result<Option<Vec<CartId>>, StoreError> {
        let rows = sqlx::query("SELECT cart_id FROM order_carts WHERE order_id = $1 ORDER BY cart_id")
            .bind(order_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("carts_for_order", e))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let carts = rows
            .iter()
            .map(|row| {
                row.try_get::<Uuid, _>("cart_id")
                    .map(CartId::from_uuid)
                    .map_err(|e| decode_error("order cart", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(carts))
    }
}
