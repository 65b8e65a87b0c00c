//! PostgreSQL-backed stores.
//!
//! Each store holds a shared `PgPool` and maps rows by hand (`Row::try_get`).
//! Seat ownership is guarded by a conditional `UPDATE`, so the compare-and-set
//! holds across any number of service instances sharing the database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Invariant` (duplicate key) |
//! | Database (check constraint violation) | `23514` | `Invariant` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |

mod carts;
mod orders;
mod payments;
mod seats;

pub use carts::PostgresCartStore;
pub use orders::PostgresOrderDirectory;
pub use payments::PostgresPaymentLedger;
pub use seats::PostgresSeatRegistry;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use crate::store::StoreError;

const SCHEMA: &str = include_str!("../../migrations/0001_reservation_core.sql");

/// Open a connection pool.
#[instrument(skip(database_url), err)]
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Create tables and indexes if they do not exist yet.
#[instrument(skip(pool), err)]
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    info!("reservation schema applied");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Invariant(format!("duplicate key: {msg}")),
                // Check constraint violation
                Some("23514") => StoreError::Invariant(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn decode_error(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("failed to decode {what} row: {err}"))
}

/// Narrow an `i64` column into the unsigned domain type.
pub(crate) fn non_negative<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| {
        StoreError::Invariant(format!("column {column} out of range: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_negative_rejects_out_of_range_values() {
        assert_eq!(non_negative::<u64>("version", 3).unwrap(), 3);
        assert!(matches!(
            non_negative::<u32>("row_number", -1),
            Err(StoreError::Invariant(msg)) if msg.contains("row_number")
        ));
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("list", sqlx::Error::PoolClosed),
            StoreError::Storage(msg) if msg.contains("pool closed in list")
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            StoreError::Storage(_)
        ));
    }

    #[test]
    fn schema_guards_seat_holder_consistency() {
        assert!(SCHEMA.contains("(status = 'available') = (holder_cart_id IS NULL)"));
        assert!(SCHEMA.contains("PRIMARY KEY (cart_id, event_id, seat_id)"));
        assert!(SCHEMA.contains("CHECK (cardinality(seat_event_ids) = cardinality(seat_ids))"));
    }
}
