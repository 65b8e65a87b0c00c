//! Service wiring: picks the store backend and builds one coordinator over it.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use boxoffice_core::{CartId, OrderId};
use boxoffice_seating::Seat;

use crate::config::{ReservationConfig, StorageBackend};
use crate::coordinator::ReservationCoordinator;
use crate::postgres::{
    self, PostgresCartStore, PostgresOrderDirectory, PostgresPaymentLedger, PostgresSeatRegistry,
};
use crate::store::{
    CartStore, InMemoryCartStore, InMemoryOrderDirectory, InMemoryPaymentLedger,
    InMemorySeatRegistry, OrderDirectory, PaymentLedger, SeatRegistry, StoreError,
};

/// Coordinator over type-erased stores; the same type for every backend.
pub type SharedCoordinator = ReservationCoordinator<
    Arc<dyn SeatRegistry>,
    Arc<dyn CartStore>,
    Arc<dyn PaymentLedger>,
    Arc<dyn OrderDirectory>,
>;

pub enum ReservationServices {
    InMemory {
        coordinator: Arc<SharedCoordinator>,
        seats: Arc<InMemorySeatRegistry>,
        orders: Arc<InMemoryOrderDirectory>,
    },
    Persistent {
        coordinator: Arc<SharedCoordinator>,
        pool: PgPool,
        seats: Arc<PostgresSeatRegistry>,
        orders: Arc<PostgresOrderDirectory>,
    },
}

impl ReservationServices {
    pub async fn build(config: &ReservationConfig) -> anyhow::Result<Self> {
        match &config.storage {
            StorageBackend::InMemory => Ok(Self::in_memory()),
            StorageBackend::Postgres {
                database_url,
                max_connections,
            } => Self::persistent(database_url, *max_connections).await,
        }
    }

    /// In-memory wiring (dev/test).
    pub fn in_memory() -> Self {
        let seats = Arc::new(InMemorySeatRegistry::new());
        let orders = Arc::new(InMemoryOrderDirectory::new());
        let coordinator = ReservationCoordinator::new(
            seats.clone() as Arc<dyn SeatRegistry>,
            Arc::new(InMemoryCartStore::new()) as Arc<dyn CartStore>,
            Arc::new(InMemoryPaymentLedger::new()) as Arc<dyn PaymentLedger>,
            orders.clone() as Arc<dyn OrderDirectory>,
        );

        info!(backend = "in_memory", "reservation services ready");
        Self::InMemory {
            coordinator: Arc::new(coordinator),
            seats,
            orders,
        }
    }

    pub async fn persistent(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = postgres::connect(database_url, max_connections)
            .await
            .context("failed to connect to Postgres")?;
        postgres::apply_schema(&pool)
            .await
            .context("failed to apply reservation schema")?;

        let seats = Arc::new(PostgresSeatRegistry::new(pool.clone()));
        let orders = Arc::new(PostgresOrderDirectory::new(pool.clone()));
        let coordinator = ReservationCoordinator::new(
            seats.clone() as Arc<dyn SeatRegistry>,
            Arc::new(PostgresCartStore::new(pool.clone())) as Arc<dyn CartStore>,
            Arc::new(PostgresPaymentLedger::new(pool.clone())) as Arc<dyn PaymentLedger>,
            orders.clone() as Arc<dyn OrderDirectory>,
        );

        info!(backend = "postgres", max_connections, "reservation services ready");
        Ok(Self::Persistent {
            coordinator: Arc::new(coordinator),
            pool,
            seats,
            orders,
        })
    }

    pub fn coordinator(&self) -> Arc<SharedCoordinator> {
        match self {
            Self::InMemory { coordinator, .. } | Self::Persistent { coordinator, .. } => {
                Arc::clone(coordinator)
            }
        }
    }

    /// Load venue seats supplied by the seat-map collaborator.
    pub async fn publish_seats(
        &self,
        seats: impl IntoIterator<Item = Seat>,
    ) -> Result<usize, StoreError> {
        let mut published = 0;
        for seat in seats {
            match self {
                Self::InMemory { seats: registry, .. } => registry.register(seat)?,
                Self::Persistent { seats: registry, .. } => registry.publish(&seat).await?,
            }
            published += 1;
        }
        Ok(published)
    }

    /// Record that `cart_id` belongs to `order_id` (order collaborator feed).
    pub async fn assign_cart(&self, order_id: OrderId, cart_id: CartId) -> Result<(), StoreError> {
        match self {
            Self::InMemory { orders, .. } => orders.assign(order_id, cart_id),
            Self::Persistent { orders, .. } => orders.assign(order_id, cart_id).await,
        }
    }
}
