//! Error types for cloud facade calls.

use thiserror::Error;

/// Errors raised by [`super::CloudFacade`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when the cloud configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the identity service rejects the credentials.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Message returned by the identity service.
        message: String,
    },
    /// Raised when the service catalog lacks a required endpoint.
    #[error("no {service} endpoint in the service catalog")]
    MissingEndpoint {
        /// Service type that was looked up (for example `compute`).
        service: String,
    },
    /// Raised when a request returns a non-success HTTP status.
    #[error("{method} {url} returned {status}: {message}")]
    Http {
        /// HTTP method of the failed request.
        method: String,
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },
    /// Raised when a requested resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind (for example `volume`).
        resource: String,
        /// Identifier that was looked up.
        id: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("failed to parse {resource} response: {message}")]
    Parse {
        /// Resource being parsed.
        resource: String,
        /// Decoder error message.
        message: String,
    },
    /// Wrapper for transport level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the HTTP client.
        message: String,
    },
}

impl From<reqwest::Error> for CloudError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}
