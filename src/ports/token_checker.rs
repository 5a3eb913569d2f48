use async_trait::async_trait;
use thiserror::Error;

/// Errors from the token-check collaborator.
///
/// The token service is itself resolved through the dynamic-routing path,
/// so "unreachable" covers both discovery and transport failures. Callers
/// treat every error as an authorization failure (fail closed).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TokenCheckError {
    /// No instance of the token service could be reached.
    #[error("token service unreachable: {0}")]
    Unreachable(String),

    /// The token service answered with something other than a verdict.
    #[error("invalid token service response: {0}")]
    InvalidResponse(String),
}

/// Port to the token-check collaborator.
#[async_trait]
pub trait TokenChecker: Send + Sync + 'static {
    /// Whether `token` identifies a valid principal.
    async fn check_token(&self, token: &str) -> Result<bool, TokenCheckError>;
}
