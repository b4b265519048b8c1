//! Delivery error taxonomy.

use chrono::{DateTime, Utc};
use thiserror::Error;

use pushgate_common::error::AppError;

/// The provider rejected a notification. Never resent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct DeliveryError {
    /// Provider status or error code, when the provider supplied one.
    pub code: Option<i32>,
    pub description: String,
}

impl DeliveryError {
    pub fn new(code: Option<i32>, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A transient failure. The notification is scheduled for another attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct RetryableError {
    pub description: String,
    /// Provider-supplied earliest retry time. Overrides computed backoff.
    pub retry_after: Option<DateTime<Utc>>,
}

impl RetryableError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<DateTime<Utc>>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Failure of the connection itself rather than one notification.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Error surfaced by a dispatcher call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Retryable(#[from] RetryableError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Bad or missing credentials. The app is taken out of service.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(#[from] AppError),
}

impl From<reqwest::Error> for RetryableError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RetryableError::new(format!("Request timed out: {}", e))
        } else if e.is_connect() {
            RetryableError::new(format!("Connection failed: {}", e))
        } else {
            RetryableError::new(format!("HTTP transport error: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DispatchError::from(DeliveryError::new(Some(8), "Invalid token"));
        assert_eq!(err.to_string(), "Invalid token");

        let err = DispatchError::from(ConnectionError::Timeout(std::time::Duration::from_secs(2)));
        assert_eq!(err.to_string(), "Connection error: Timed out after 2s");

        let err = DispatchError::Configuration("missing certificate".into());
        assert_eq!(err.to_string(), "Configuration error: missing certificate");
    }

    #[test]
    fn test_retry_after_builder() {
        let at = Utc::now();
        let err = RetryableError::new("429 Too Many Requests").with_retry_after(Some(at));
        assert_eq!(err.retry_after, Some(at));
    }
}
