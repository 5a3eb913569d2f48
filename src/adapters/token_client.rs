//! Token verification against the platform's OAuth service.
//!
//! The token service is just another registered service name: instances are
//! resolved through the shared cache and balancer, so the gateway has no
//! static address for it. When the service cannot be discovered or reached
//! the check fails, and authorization fails closed with it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::Request;
use serde::Deserialize;

use crate::{
    core::{discovery::InstanceCache, load_balancer::Balance},
    ports::{
        http_client::HttpClient,
        token_checker::{TokenCheckError, TokenChecker},
    },
};

pub struct OAuthTokenChecker {
    cache: Arc<InstanceCache>,
    balance: Arc<dyn Balance>,
    http_client: Arc<dyn HttpClient>,
    service_name: String,
    check_path: String,
}

impl OAuthTokenChecker {
    pub fn new(
        cache: Arc<InstanceCache>,
        balance: Arc<dyn Balance>,
        http_client: Arc<dyn HttpClient>,
        service_name: impl Into<String>,
        check_path: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            balance,
            http_client,
            service_name: service_name.into(),
            check_path: check_path.into(),
        }
    }
}

/// Subset of the token service's verdict body. A populated `error` field
/// (or a non-2xx status) is a negative verdict.
#[derive(Deserialize)]
struct CheckTokenResponse {
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl TokenChecker for OAuthTokenChecker {
    async fn check_token(&self, token: &str) -> Result<bool, TokenCheckError> {
        let instances = self
            .cache
            .discover(&self.service_name)
            .await
            .map_err(|err| TokenCheckError::Unreachable(err.to_string()))?;
        let instance = self
            .balance
            .select(&instances)
            .map_err(|err| TokenCheckError::Unreachable(err.to_string()))?;

        let uri = format!(
            "http://{}{}?token={}",
            instance.authority(),
            self.check_path,
            urlencoding::encode(token)
        );
        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .body(AxumBody::empty())
            .map_err(|err| TokenCheckError::InvalidResponse(err.to_string()))?;

        let response = self
            .http_client
            .send_request(request)
            .await
            .map_err(|err| TokenCheckError::Unreachable(err.to_string()))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| TokenCheckError::InvalidResponse(err.to_string()))?
            .to_bytes();
        let verdict: CheckTokenResponse = serde_json::from_slice(&body)
            .map_err(|err| TokenCheckError::InvalidResponse(err.to_string()))?;

        Ok(verdict.error.as_deref().is_none_or(str::is_empty))
    }
}
