use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for forwarding requests to service instances.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The instance could not be reached or dropped the connection.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The outbound request could not be constructed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding HTTP requests to
/// resolved service instances.
///
/// Implementations must not enforce their own overall deadline shorter than
/// the circuit breaker's timeout; the breaker owns the per-request clock.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to the instance named in the request URI and
    /// return its response unmodified.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
