//! Inventory route handlers.
//!
//! Every storage call runs inside [`profiled`] on the storage tracer, so it
//! shows up as a child of the request span under the storage service.

use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tokio::time;

use crate::http::error::AppError;
use crate::http::middleware::TraceContext;
use crate::http::server::AppState;
use crate::inventory::{Product, ProductInput, StoreError};
use crate::observability::profiled;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn list_products(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
) -> Result<Json<Vec<Product>>, AppError> {
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    let products = profiled(&cx, "get_products", 0, |_| store.list())
        .await
        .map_err(|e| state.storage_failure("retrieve products", "", e))?;

    tracing::info!(
        component = "http_handler",
        operation = "get_products",
        num_products = products.len(),
        "Listing products"
    );
    Ok(Json(products))
}

pub async fn get_product(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Product>, AppError> {
    let Path(id) = id.map_err(|_| AppError::InvalidId)?;
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    let product = profiled(&cx, "get_product", id, |_| store.get(id))
        .await
        .map_err(|e| state.storage_failure("retrieve product", "", e))?;

    tracing::info!(component = "http_handler", product_id = id, "Showing product");
    Ok(Json(product))
}

pub async fn create_product(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
    payload: Result<Json<ProductInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Product>), AppError> {
    let input = decode(payload)?;
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    let product = profiled(&cx, "create_product", 0, |_| store.create(input))
        .await
        .map_err(|e| state.storage_failure("create product", "", e))?;

    tracing::info!(component = "http_handler", product_id = product.id, "Product created");
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn update_product(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ProductInput>, JsonRejection>,
) -> Result<Json<Product>, AppError> {
    let Path(id) = id.map_err(|_| AppError::InvalidId)?;
    let input = decode(payload)?;
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    let product = profiled(&cx, "update_product", id, |_| store.update(id, input))
        .await
        .map_err(|e| state.storage_failure("update product", " for update", e))?;

    tracing::info!(component = "http_handler", product_id = id, "Product updated");
    Ok(Json(product))
}

pub async fn delete_product(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Value>, AppError> {
    let Path(id) = id.map_err(|_| AppError::InvalidId)?;
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    profiled(&cx, "delete_product", id, |_| store.delete(id))
        .await
        .map_err(|e| state.storage_failure("delete product", " for deletion", e))?;

    tracing::info!(component = "http_handler", product_id = id, "Product deleted");
    Ok(Json(json!({
        "result": "success",
        "message": format!("Product with ID {id} deleted"),
    })))
}

pub async fn health(
    State(state): State<AppState>,
    TraceContext(cx): TraceContext,
) -> Result<Json<Value>, AppError> {
    let cx = state.obs.storage_context(&cx);
    let store = &state.store;

    profiled(&cx, "health_check", 0, |_| async {
        match time::timeout(HEALTH_TIMEOUT, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(HEALTH_TIMEOUT)),
        }
    })
    .await
    .map_err(|e| {
        tracing::warn!(component = "http_handler", error = %e, "Health check failed");
        AppError::Unavailable(e.to_string())
    })?;

    Ok(Json(json!({ "status": "ok", "database": "connected" })))
}

pub async fn route_not_found() -> AppError {
    AppError::RouteNotFound
}

fn decode(payload: Result<Json<ProductInput>, JsonRejection>) -> Result<ProductInput, AppError> {
    let Json(input) = payload.map_err(|e| {
        tracing::warn!(component = "http_handler", error = %e, "Invalid request payload");
        AppError::InvalidPayload
    })?;
    if !input.is_valid() {
        tracing::warn!(component = "http_handler", "Rejected invalid product data");
        return Err(AppError::InvalidProduct);
    }
    Ok(input)
}

impl AppState {
    /// Map a storage error, counting everything except not-found.
    fn storage_failure(&self, action: &'static str, not_found_context: &'static str, err: StoreError) -> AppError {
        match err {
            StoreError::NotFound(id) => {
                tracing::info!(component = "http_handler", product_id = id, "Product not found");
                AppError::NotFound {
                    id,
                    context: not_found_context,
                }
            }
            other => {
                self.obs.metrics().storage_error();
                tracing::error!(component = "http_handler", action, error = %other, "Storage operation failed");
                AppError::Storage { action, source: other }
            }
        }
    }
}
