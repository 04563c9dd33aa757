//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check profile type names
//! - Check the collector endpoint when tracing failures are fatal
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{FailurePolicy, ServiceConfig};
use crate::observability::tracer_provider::collector_url;
use crate::profiling::ProfileType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address `{value}`")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field}: must not be empty")]
    Empty { field: &'static str },

    #[error("tracing.endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("profiling.profile_types: unknown profile type `{0}`")]
    UnknownProfileType(String),

    #[error("observability.metrics_address: collides with listener.bind_address")]
    AddressCollision,
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = check_address("listener.bind_address", &config.listener.bind_address, &mut errors);
    if config.observability.metrics_enabled {
        let metrics = check_address(
            "observability.metrics_address",
            &config.observability.metrics_address,
            &mut errors,
        );
        if listener.is_some() && listener == metrics {
            errors.push(ValidationError::AddressCollision);
        }
    }

    let positive = [
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("tracing.batch_interval_ms", config.tracing.batch_interval_ms),
        ("tracing.export_timeout_secs", config.tracing.export_timeout_secs),
        ("tracing.shutdown_timeout_secs", config.tracing.shutdown_timeout_secs),
        ("refresher.interval_secs", config.refresher.interval_secs),
        ("refresher.timeout_secs", config.refresher.timeout_secs),
        ("shutdown.grace_secs", config.shutdown.grace_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration { field });
        }
    }

    // Under the degraded policy a bad endpoint degrades the providers at startup.
    if config.tracing.failure_policy == FailurePolicy::Fatal {
        if let Err(e) = collector_url(&config.tracing.endpoint) {
            errors.push(ValidationError::InvalidEndpoint(e.to_string()));
        }
    }
    if config.tracing.application_service.trim().is_empty() {
        errors.push(ValidationError::Empty {
            field: "tracing.application_service",
        });
    }
    if config.tracing.storage_service.trim().is_empty() {
        errors.push(ValidationError::Empty {
            field: "tracing.storage_service",
        });
    }

    // Profiling failures degrade at runtime; only reject names we can never honor.
    if config.profiling.enabled {
        for name in &config.profiling.profile_types {
            if name.parse::<ProfileType>().is_err() {
                errors.push(ValidationError::UnknownProfileType(name.clone()));
            }
        }
        if config.profiling.sample_interval_ms == 0 {
            errors.push(ValidationError::ZeroDuration {
                field: "profiling.sample_interval_ms",
            });
        }
        if config.profiling.upload_interval_secs == 0 {
            errors.push(ValidationError::ZeroDuration {
                field: "profiling.upload_interval_secs",
            });
        }
        if config.profiling.upload_timeout_secs == 0 {
            errors.push(ValidationError::ZeroDuration {
                field: "profiling.upload_timeout_secs",
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(field: &'static str, value: &str, errors: &mut Vec<ValidationError>) -> Option<SocketAddr> {
    match value.parse::<SocketAddr>() {
        Ok(addr) => Some(addr),
        Err(_) => {
            errors.push(ValidationError::InvalidAddress {
                field,
                value: value.to_string(),
            });
            None
        }
    }
}
