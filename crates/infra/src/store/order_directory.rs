use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use boxoffice_core::{CartId, OrderId};

use super::StoreError;

/// Resolves an order to the carts it released. Order aggregation itself is
/// owned elsewhere; the reservation core only reads this mapping.
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    /// `None` when the order is unknown.
    async fn carts_for_order(&self, order_id: OrderId) -> Result<Option<Vec<CartId>>, StoreError>;
}

#[async_trait]
impl<S> OrderDirectory for Arc<S>
where
    S: OrderDirectory + ?Sized,
{
    async fn carts_for_order(&self, order_id: OrderId) -> Result<Option<Vec<CartId>>, StoreError> {
        (**self).carts_for_order(order_id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOrderDirectory {
    orders: RwLock<HashMap<OrderId, Vec<CartId>>>,
}

impl InMemoryOrderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cart list of `order_id`.
    pub fn insert(
        &self,
        order_id: OrderId,
        carts: impl IntoIterator<Item = CartId>,
    ) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(|_| StoreError::poisoned())?;
        orders.insert(order_id, carts.into_iter().collect());
        Ok(())
    }

    /// Attach one more cart to `order_id`, creating the order if needed.
    pub fn assign(&self, order_id: OrderId, cart_id: CartId) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(|_| StoreError::poisoned())?;
        let carts = orders.entry(order_id).or_default();
        if !carts.contains(&cart_id) {
            carts.push(cart_id);
        }
        Ok(())
    }
}

#[async_trait]
impl OrderDirectory for InMemoryOrderDirectory {
    async fn carts_for_order(&self, order_id: OrderId) -> Result<Option<Vec<CartId>>, StoreError> {
        let orders = self.orders.read().map_err(|_| StoreError::poisoned())?;
        Ok(orders.get(&order_id).cloned())
    }
}
