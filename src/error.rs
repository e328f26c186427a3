//! Error types surfaced to callers of an intercepted session.

use std::sync::Arc;

/// Boxed error type accepted for registered failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while registering expectations or resolving calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No expectation matched the call (or a redirect hop).
    #[error("Connection refused: {method} {url}")]
    ConnectionRefused { method: http::Method, url: String },

    /// An error registered on an expectation, raised verbatim.
    #[error(transparent)]
    Raised(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// Simulated timeout registered with the `timeout` shorthand.
    #[error("Timeout: {method} {url}")]
    Timeout { method: http::Method, url: String },

    /// Non-2xx response when status-based raising is enabled.
    #[error("{status}, message='{reason}', url='{url}'")]
    Status {
        status: u16,
        reason: String,
        url: String,
    },

    /// The session was closed before the call was issued.
    #[error("Session is closed")]
    SessionClosed,

    /// `start` called on an interceptor that is already active.
    #[error("Interceptor is already active")]
    AlreadyActive,

    /// `stop` called on an interceptor that is not active.
    #[error("Interceptor is not active")]
    NotActive,

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// A fixture expectation from the configuration could not be built.
    #[error("Invalid fixture: {0}")]
    Fixture(String),

    /// Structured payload could not be serialized to JSON.
    #[error("Invalid payload: {0}")]
    Payload(Arc<serde_json::Error>),

    /// Response body could not be decoded as JSON.
    #[error("Failed to decode response body: {0}")]
    Decode(Arc<serde_json::Error>),

    /// The response was released when the interceptor stopped.
    #[error("Response has been released")]
    ResponseClosed,

    /// Failure reported by the real transport on passthrough.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Wrap an arbitrary error so it is raised as-is to the caller.
    pub fn raised<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Raised(Arc::new(error))
    }

    /// Downcast a registered error back to its concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::Raised(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this is the no-match error.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::ConnectionRefused { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("oops")]
    struct Oops;

    #[test]
    fn test_raised_downcasts_to_original() {
        let err = Error::raised(Oops);
        assert!(err.downcast_ref::<Oops>().is_some());
        assert_eq!(err.to_string(), "oops");
    }

    #[test]
    fn test_connection_refused_message() {
        let err = Error::ConnectionRefused {
            method: http::Method::GET,
            url: "http://example.com/api".to_string(),
        };
        assert!(err.is_connection_refused());
        assert_eq!(err.to_string(), "Connection refused: GET http://example.com/api");
        assert!(err.downcast_ref::<Oops>().is_none());
    }
}
