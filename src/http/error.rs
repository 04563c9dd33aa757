//! Handler errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::http::response::HandlerFailure;
use crate::inventory::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("product with ID {id} not found{context}")]
    NotFound { id: i64, context: &'static str },

    #[error("invalid product ID")]
    InvalidId,

    #[error("invalid request payload")]
    InvalidPayload,

    #[error("invalid product data: name is required, price and quantity cannot be negative")]
    InvalidProduct,

    /// Storage failed; the client only sees which action failed.
    #[error("failed to {action}")]
    Storage {
        action: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("storage connection failed: {0}")]
    Unavailable(String),

    #[error("route not found")]
    RouteNotFound,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::InvalidId | Self::InvalidPayload | Self::InvalidProduct => StatusCode::BAD_REQUEST,
            Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        let failure = match &self {
            Self::Storage { source, .. } => format!("{message}: {source}"),
            _ => message.clone(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        response.extensions_mut().insert(HandlerFailure(failure));
        response
    }
}
