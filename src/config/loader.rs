//! Configuration loading from disk and environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::ServiceConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Collector address used inside a Kubernetes cluster.
pub const KUBERNETES_COLLECTOR: &str = "otel-collector-service.api-app-go:4317";

/// Collector address used everywhere else (docker compose).
pub const DEFAULT_COLLECTOR: &str = "otel-collector:4317";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration from an optional TOML file, apply environment
/// overrides, then validate.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content)?
        }
        None => ServiceConfig::default(),
    };

    apply_env_overrides(&mut config, |key| env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply the documented environment variables on top of file values.
///
/// `lookup` returns the value of a variable, or `None` when unset or empty.
pub fn apply_env_overrides<F>(config: &mut ServiceConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(endpoint) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.tracing.endpoint = endpoint;
    } else if get("KUBERNETES_SERVICE_HOST").is_some() {
        config.tracing.endpoint = KUBERNETES_COLLECTOR.to_string();
    }

    if let Some(name) = get("OTEL_SERVICE_NAME") {
        config.tracing.application_service = name.clone();
        config.profiling.application_name = name;
    }

    if let Some(url) = get("PYROSCOPE_URL") {
        config.profiling.server_url = url;
    }

    if let Some(env) = get("APP_ENV") {
        config.tracing.environment = env;
    }
}
