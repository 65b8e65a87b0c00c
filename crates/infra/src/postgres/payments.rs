use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use boxoffice_core::{CartId, EventId, Expected, Money, PaymentId, SeatId};
use boxoffice_payments::{Payment, PaymentStatus};
use boxoffice_seating::SeatRef;

use super::{decode_error, map_sqlx_error};
use crate::store::{PaymentLedger, StoreError};

const PAYMENT_COLUMNS: &str =
    "payment_id, cart_id, amount_cents, seat_event_ids, seat_ids, status, created_at, updated_at";

/// Payment ledger over the `payments` table.
#[derive(Debug, Clone)]
pub struct PostgresPaymentLedger {
    pool: PgPool,
}

impl PostgresPaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentLedger for PostgresPaymentLedger {
    #[instrument(
        skip(self, seats),
        fields(cart_id = %cart_id, amount = %amount, seat_count = seats.len()),
        err
    )]
    async fn create(
        &self,
        cart_id: CartId,
        amount: Money,
        seats: Vec<SeatRef>,
    ) -> Result<Payment, StoreError> {
        let event_ids: Vec<i64> = seats.iter().map(|s| s.event_id.get()).collect();
        let seat_ids: Vec<i64> = seats.iter().map(|s| s.seat_id.get()).collect();
        let payment = Payment::open(cart_id, amount, seats, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO payments (
                payment_id, cart_id, amount_cents, seat_event_ids, seat_ids,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(payment.id_typed().as_uuid())
        .bind(cart_id.as_uuid())
        .bind(amount.to_minor()?)
        .bind(event_ids)
        .bind(seat_ids)
        .bind(payment.status().as_str())
        .bind(payment.created_at())
        .bind(payment.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_payment", e))?;

        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_payment", e))?;

        row.as_ref().map(payment_from_row).transpose()
    }

    #[instrument(skip(self), fields(cart_id = %cart_id), err)]
    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE cart_id = $1
            ORDER BY created_at, payment_id
            "#
        ))
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_payments_by_cart", e))?;

        rows.iter().map(payment_from_row).collect()
    }

    /// Lifecycle legality is checked in Rust on the current row; the `UPDATE`
    /// is conditional on that row's status so a concurrent settle cannot be
    /// overwritten.
    #[instrument(skip(self), fields(payment_id = %payment_id, next = %next), err)]
    async fn update_status(
        &self,
        payment_id: PaymentId,
        expected: Expected<PaymentStatus>,
        next: PaymentStatus,
    ) -> Result<Payment, StoreError> {
        let mut payment = self
            .get(payment_id)
            .await?
            .ok_or(StoreError::PaymentNotFound(payment_id))?;

        let current = payment.status();
        if !expected.matches(&current) {
            return Err(StoreError::PaymentConflict {
                payment: payment_id,
                found: current,
            });
        }
        payment.transition(next, Utc::now())?;

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, updated_at = $4
            WHERE payment_id = $1 AND status = $2
            "#,
        )
        .bind(payment_id.as_uuid())
        .bind(current.as_str())
        .bind(next.as_str())
        .bind(payment.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_payment_status", e))?;

        if result.rows_affected() == 0 {
            let found = self
                .get(payment_id)
                .await?
                .ok_or(StoreError::PaymentNotFound(payment_id))?
                .status();
            return Err(StoreError::PaymentConflict {
                payment: payment_id,
                found,
            });
        }

        Ok(payment)
    }
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let payment_id: Uuid = row
        .try_get("payment_id")
        .map_err(|e| decode_error("payment", e))?;
    let cart_id: Uuid = row.try_get("cart_id").map_err(|e| decode_error("payment", e))?;
    let amount_cents: i64 = row
        .try_get("amount_cents")
        .map_err(|e| decode_error("payment", e))?;
    let seat_event_ids: Vec<i64> = row
        .try_get("seat_event_ids")
        .map_err(|e| decode_error("payment", e))?;
    let seat_ids: Vec<i64> = row.try_get("seat_ids").map_err(|e| decode_error("payment", e))?;
    if seat_event_ids.len() != seat_ids.len() {
        return Err(StoreError::Invariant(format!(
            "payment {payment_id} has {} seat events for {} seats",
            seat_event_ids.len(),
            seat_ids.len()
        )));
    }
    let seats = seat_event_ids
        .into_iter()
        .zip(seat_ids)
        .map(|(event_id, seat_id)| SeatRef::new(EventId::new(event_id), SeatId::new(seat_id)))
        .collect();
    let status: String = row.try_get("status").map_err(|e| decode_error("payment", e))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| decode_error("payment", e))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| decode_error("payment", e))?;

    Ok(Payment::restore(
        PaymentId::from_uuid(payment_id),
        CartId::from_uuid(cart_id),
        Money::from_minor(amount_cents)?,
        seats,
        PaymentStatus::parse(&status)?,
        created_at,
        updated_at,
    ))
}
