//! Custom error types for the fleet router.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Primary error type for the routing layer, covering all possible error cases.
#[derive(Debug, Error)]
pub enum AppError {
    /// The endpoint is isolated by its circuit breaker.
    #[error("Circuit open for {name}, retry in {}ms", remaining_ms(.retry_after))]
    CircuitOpen {
        /// Name of the breaker (usually the node name).
        name: String,
        /// Instant at which the breaker will admit probe calls again.
        retry_after: Instant,
    },

    /// No pooled connection became available in time.
    #[error("Timed out after {waited:?} waiting for a connection to {base_url}")]
    PoolAcquisitionTimeout { base_url: String, waited: Duration },

    /// The pool has been shut down.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// Every credential slot is within its cooldown window.
    #[error("All credentials are cooling down, retry in {}ms", remaining_ms(.retry_after))]
    AllCredentialsCooling { retry_after: Instant },

    /// No online node advertises the requested model.
    #[error("No online node serves model '{model}'")]
    NoCapacity { model: String },

    /// The upstream inference call itself failed.
    #[error("Upstream call failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Upstream {
        /// HTTP status, when the upstream answered at all.
        status: Option<u16>,
        message: String,
    },

    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Errors from invalid input data or parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn remaining_ms(at: &Instant) -> u128 {
    at.saturating_duration_since(Instant::now()).as_millis()
}

impl AppError {
    /// Whether this error says something about the health of the endpoint.
    ///
    /// Errors raised before an upstream call is attempted (open circuit, pool
    /// backpressure, exhausted credentials, no capacity) must never be counted
    /// against a breaker.
    pub fn counts_as_endpoint_failure(&self) -> bool {
        !matches!(
            self,
            AppError::CircuitOpen { .. }
                | AppError::PoolAcquisitionTimeout { .. }
                | AppError::PoolClosed
                | AppError::AllCredentialsCooling { .. }
                | AppError::NoCapacity { .. }
        )
    }

    /// Retry instant carried by the error, if any.
    pub fn retry_after(&self) -> Option<Instant> {
        match self {
            AppError::CircuitOpen { retry_after, .. }
            | AppError::AllCredentialsCooling { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status of an upstream failure.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            AppError::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Implementation to convert AppError into an HTTP response for Axum.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::CircuitOpen { .. }
            | AppError::AllCredentialsCooling { .. }
            | AppError::NoCapacity { .. }
            | AppError::PoolAcquisitionTimeout { .. }
            | AppError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let retry_after_secs = self.retry_after().map(|at| {
            let remaining = at.saturating_duration_since(Instant::now());
            // Round up so clients never retry early.
            remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
        });

        let body = Json(json!({
            "error": self.to_string(),
            "retry_after_secs": retry_after_secs,
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Convenience type alias for Results with AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::Internal(format!("{}: {}", f(), e)))
    }
}

/// Run an upstream operation with a deadline, mapping expiry to an upstream failure.
pub async fn with_timeout<T, F>(
    operation: F,
    timeout_duration: Duration,
    context: &'static str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout_duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Upstream {
            status: None,
            message: format!(
                "{}: operation timed out after {:?}",
                context, timeout_duration
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_call_errors_are_not_endpoint_failures() {
        let open = AppError::CircuitOpen {
            name: "node-a".to_string(),
            retry_after: Instant::now(),
        };
        assert!(!open.counts_as_endpoint_failure());
        assert!(!AppError::PoolAcquisitionTimeout {
            base_url: "http://a".to_string(),
            waited: Duration::from_secs(5),
        }
        .counts_as_endpoint_failure());
        assert!(AppError::Upstream {
            status: Some(500),
            message: "boom".to_string(),
        }
        .counts_as_endpoint_failure());
    }

    #[test]
    fn test_upstream_display_includes_status() {
        let err = AppError::Upstream {
            status: Some(429),
            message: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream call failed (429): slow down");
        assert_eq!(err.upstream_status(), Some(429));
    }

    #[tokio::test]
    async fn test_circuit_open_response_sets_retry_after() {
        let err = AppError::CircuitOpen {
            name: "node-a".to_string(),
            retry_after: Instant::now() + Duration::from_millis(1500),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from(2u64)
        );
    }

    #[tokio::test]
    async fn test_with_timeout_maps_expiry_to_upstream() {
        tokio::time::pause();
        let result: Result<()> = with_timeout(
            std::future::pending(),
            Duration::from_millis(10),
            "probe",
        )
        .await;
        assert!(matches!(result, Err(AppError::Upstream { status: None, .. })));
    }
}
