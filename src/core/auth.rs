//! Authorization prefilter: public-path matching and token verification.
//!
//! Paths matching a configured public pattern bypass token checks entirely.
//! Everything else must carry an `Authorization` header that the token
//! service accepts; any transport failure on the token check fails closed.

use std::sync::Arc;

use hyper::{HeaderMap, header};
use regex::Regex;
use thiserror::Error;

use crate::ports::token_checker::{TokenCheckError, TokenChecker};

/// Reasons a request is rejected before routing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    #[error("empty request path")]
    EmptyPath,

    #[error("missing authorization credential")]
    MissingCredential,

    #[error("token rejected")]
    TokenRejected,

    #[error("token check failed: {0}")]
    TokenService(#[source] TokenCheckError),
}

/// Compiled set of public-path patterns.
///
/// Patterns use `**` as the only wildcard, matching any character sequence
/// including segment separators. Literal portions are regex-escaped before
/// compilation and the whole pattern is anchored, so metacharacters in a
/// pattern match themselves.
pub struct PermitMatcher {
    patterns: Vec<Regex>,
}

impl PermitMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|pattern| Regex::new(&Self::glob_to_regex(pattern)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns: compiled })
    }

    /// Whether `path` matches any configured public pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }

    fn glob_to_regex(pattern: &str) -> String {
        let escaped = pattern
            .split("**")
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        format!("^{escaped}$")
    }
}

/// Runs the authorization prefilter for the dispatcher.
pub struct AuthFilter {
    matcher: PermitMatcher,
    token_checker: Arc<dyn TokenChecker>,
}

impl AuthFilter {
    pub fn new(matcher: PermitMatcher, token_checker: Arc<dyn TokenChecker>) -> Self {
        Self {
            matcher,
            token_checker,
        }
    }

    /// Authorize a request by path and headers.
    ///
    /// Public paths pass unconditionally. Other paths need an
    /// `Authorization` header that the token service confirms; a negative
    /// verdict or an unreachable token service both reject the request.
    pub async fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<(), AuthError> {
        if path.is_empty() {
            return Err(AuthError::EmptyPath);
        }
        if self.matcher.matches(path) {
            return Ok(());
        }

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        match self.token_checker.check_token(token).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::TokenRejected),
            Err(err) => {
                tracing::warn!(error = %err, "token check failed, rejecting request");
                Err(AuthError::TokenService(err))
            }
        }
    }
}
