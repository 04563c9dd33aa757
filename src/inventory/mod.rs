//! Inventory domain: product storage and the background product-count gauge.

pub mod refresher;
pub mod store;

pub use refresher::ProductCountRefresher;
pub use store::{InMemoryStore, Product, ProductCounter, ProductInput, ProductStore, StoreError};
