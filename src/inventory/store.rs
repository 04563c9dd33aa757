//! Product storage.
//!
//! The HTTP layer only sees the [`ProductStore`] trait; the refresher only
//! needs [`ProductCounter`]. [`InMemoryStore`] is the bundled implementation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub quantity: i64,
    pub price: f64,
}

/// Client-supplied product fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductInput {
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
}

impl ProductInput {
    /// Name required; quantity and price non-negative.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.quantity >= 0 && self.price >= 0.0 && self.price.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("product {0} not found")]
    NotFound(i64),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Counts products. Implemented by every store.
pub trait ProductCounter: Send + Sync {
    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>>;
}

/// CRUD access to products.
pub trait ProductStore: ProductCounter {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Product>, StoreError>>;

    fn get(&self, id: i64) -> BoxFuture<'_, Result<Product, StoreError>>;

    fn create(&self, input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>>;

    fn update(&self, id: i64, input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>>;

    fn delete(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Liveness check used by `/health`.
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Lock-sharded in-memory store.
#[derive(Debug)]
pub struct InMemoryStore {
    products: DashMap<i64, Product>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            products: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Store pre-populated with `inputs`, ids assigned in order.
    pub fn with_products(inputs: impl IntoIterator<Item = ProductInput>) -> Self {
        let store = Self::new();
        for input in inputs {
            store.insert(input);
        }
        store
    }

    fn insert(&self, input: ProductInput) -> Product {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let product = Product {
            id,
            name: input.name,
            quantity: input.quantity,
            price: input.price,
        };
        self.products.insert(id, product.clone());
        product
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductCounter for InMemoryStore {
    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(future::ready(Ok(self.products.len() as u64)))
    }
}

impl ProductStore for InMemoryStore {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Product>, StoreError>> {
        let mut products: Vec<Product> = self.products.iter().map(|entry| entry.value().clone()).collect();
        products.sort_by_key(|p| p.id);
        Box::pin(future::ready(Ok(products)))
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Result<Product, StoreError>> {
        let result = self
            .products
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id));
        Box::pin(future::ready(result))
    }

    fn create(&self, input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>> {
        Box::pin(future::ready(Ok(self.insert(input))))
    }

    fn update(&self, id: i64, input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>> {
        let result = match self.products.get_mut(&id) {
            Some(mut entry) => {
                let product = entry.value_mut();
                product.name = input.name;
                product.quantity = input.quantity;
                product.price = input.price;
                Ok(product.clone())
            }
            None => Err(StoreError::NotFound(id)),
        };
        Box::pin(future::ready(result))
    }

    fn delete(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        let result = self
            .products
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id));
        Box::pin(future::ready(result))
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(future::ready(Ok(())))
    }
}
