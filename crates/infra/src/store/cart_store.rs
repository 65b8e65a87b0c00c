use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use boxoffice_carts::{CartLine, CartLineKey};
use boxoffice_core::CartId;

use super::StoreError;

/// Per-cart line items.
///
/// Lines are keyed by `(cart, event, seat)`; writes to one key are last-writer-wins.
/// A cart with no lines does not exist.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Insert the line, or replace the stored line with the same key.
    ///
    /// A replaced line keeps its position in the cart.
    async fn upsert(&self, line: CartLine) -> Result<CartLine, StoreError>;

    async fn find_line(&self, key: CartLineKey) -> Result<Option<CartLine>, StoreError>;

    /// Lines of one cart in insertion order.
    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError>;

    /// Remove every line matching `key`. Returns whether anything was removed.
    async fn delete_line(&self, key: CartLineKey) -> Result<bool, StoreError>;

    /// Remove the whole cart. Returns the number of lines removed.
    async fn delete_all_for_cart(&self, cart_id: CartId) -> Result<usize, StoreError>;
}

#[async_trait]
impl<S> CartStore for Arc<S>
where
    S: CartStore + ?Sized,
{
    async fn upsert(&self, line: CartLine) -> Result<CartLine, StoreError> {
        (**self).upsert(line).await
    }

    async fn find_line(&self, key: CartLineKey) -> Result<Option<CartLine>, StoreError> {
        (**self).find_line(key).await
    }

    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        (**self).list_by_cart(cart_id).await
    }

    async fn delete_line(&self, key: CartLineKey) -> Result<bool, StoreError> {
        (**self).delete_line(key).await
    }

    async fn delete_all_for_cart(&self, cart_id: CartId) -> Result<usize, StoreError> {
        (**self).delete_all_for_cart(cart_id).await
    }
}

/// In-memory cart store for tests/dev, indexed by cart id.
#[derive(Debug, Default)]
pub struct InMemoryCartStore {
    carts: RwLock<HashMap<CartId, Vec<CartLine>>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn upsert(&self, line: CartLine) -> Result<CartLine, StoreError> {
        let mut carts = self.carts.write().map_err(|_| StoreError::poisoned())?;
        let lines = carts.entry(line.cart_id).or_default();

        let key = line.key();
        match lines.iter_mut().find(|l| l.key() == key) {
            Some(existing) => *existing = line.clone(),
            None => lines.push(line.clone()),
        }
        Ok(line)
    }

    async fn find_line(&self, key: CartLineKey) -> Result<Option<CartLine>, StoreError> {
        let carts = self.carts.read().map_err(|_| StoreError::poisoned())?;
        Ok(carts
            .get(&key.cart_id)
            .and_then(|lines| lines.iter().find(|l| l.key() == key))
            .cloned())
    }

    async fn list_by_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        let carts = self.carts.read().map_err(|_| StoreError::poisoned())?;
        Ok(carts.get(&cart_id).cloned().unwrap_or_default())
    }

    async fn delete_line(&self, key: CartLineKey) -> Result<bool, StoreError> {
        let mut carts = self.carts.write().map_err(|_| StoreError::poisoned())?;
        let Some(lines) = carts.get_mut(&key.cart_id) else {
            return Ok(false);
        };

        let before = lines.len();
        lines.retain(|l| l.key() != key);
        let removed = lines.len() < before;

        if lines.is_empty() {
            carts.remove(&key.cart_id);
        }
        Ok(removed)
    }

    async fn delete_all_for_cart(&self, cart_id: CartId) -> Result<usize, StoreError> {
        let mut carts = self.carts.write().map_err(|_| StoreError::poisoned())?;
        Ok(carts.remove(&cart_id).map(|lines| lines.len()).unwrap_or(0))
    }
}
