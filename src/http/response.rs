//! Response status capture.
//!
//! # Responsibilities
//! - Record the status a request was answered with, exactly once
//! - Pick up the failure text a handler attached to its response
//!
//! # Design Decisions
//! - Two states: unset, then set; later writes are ignored
//! - Nothing written means 200, the same default a client would see
//! - Owned by a single request; no synchronization

use axum::http::StatusCode;
use axum::response::Response;

/// Failure description a handler attaches to an error response.
///
/// Lets instrumentation log and trace the error text without parsing the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Unset,
    Set(StatusCode),
}

/// First-write-wins record of a response status.
#[derive(Debug)]
pub struct ResponseCapture {
    state: CaptureState,
    failure: Option<String>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Unset,
            failure: None,
        }
    }

    /// Record `status` unless one is already recorded. Returns whether it was.
    pub fn record(&mut self, status: StatusCode) -> bool {
        match self.state {
            CaptureState::Unset => {
                self.state = CaptureState::Set(status);
                true
            }
            CaptureState::Set(_) => false,
        }
    }

    /// Record the status and failure text of `response`, passing it through.
    pub fn capture(&mut self, response: Response) -> Response {
        if self.record(response.status()) {
            self.failure = response
                .extensions()
                .get::<HandlerFailure>()
                .map(|failure| failure.0.clone());
        }
        response
    }

    pub fn final_status(&self) -> StatusCode {
        match self.state {
            CaptureState::Unset => StatusCode::OK,
            CaptureState::Set(status) => status,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self.state, CaptureState::Set(_))
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

impl Default for ResponseCapture {
    fn default() -> Self {
        Self::new()
    }
}
