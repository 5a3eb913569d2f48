//! The router/dispatcher: the gateway's externally visible HTTP surface.
//!
//! Each request runs through the liveness shortcut, the authorization
//! prefilter, path decomposition into `(service, rest)`, and then the
//! breaker-guarded pipeline of discovery, selection and forwarding. Callers
//! only ever see 200 (proxied), 403 (unauthorized) or 500 (fallback text).

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    http::{StatusCode, Uri, header},
};
use hyper::{Request, Response};
use thiserror::Error;

use crate::{
    core::{
        auth::AuthFilter,
        circuit_breaker::BreakerRegistry,
        discovery::{DiscoveryError, InstanceCache},
        load_balancer::{Balance, BalanceError},
    },
    ports::http_client::{HttpClient, HttpClientError},
};

/// Body of every authorization rejection.
const ILLEGAL_REQUEST: &str = "illegal request!";

/// Failure inside the breaker-guarded forwarding pipeline. All variants are
/// recovered into the fallback response, never surfaced raw.
#[derive(Error, Debug)]
enum DispatchError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error("invalid forwarding target: {0}")]
    Target(String),

    #[error("failed to forward request: {0}")]
    Forward(#[from] HttpClientError),
}

/// HTTP handler composing discovery, load balancing and circuit breaking.
#[derive(Clone)]
pub struct GatewayHandler {
    cache: Arc<InstanceCache>,
    balance: Arc<dyn Balance>,
    breakers: Arc<BreakerRegistry>,
    auth: Arc<AuthFilter>,
    http_client: Arc<dyn HttpClient>,
    health_path: String,
    fallback_message: String,
}

impl GatewayHandler {
    pub fn new(
        cache: Arc<InstanceCache>,
        balance: Arc<dyn Balance>,
        breakers: Arc<BreakerRegistry>,
        auth: Arc<AuthFilter>,
        http_client: Arc<dyn HttpClient>,
        health_path: impl Into<String>,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            balance,
            breakers,
            auth,
            http_client,
            health_path: health_path.into(),
            fallback_message: fallback_message.into(),
        }
    }

    /// Main request handler; every error becomes a response.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let path = req.uri().path().to_string();
        tracing::info!(method = %req.method(), %path, "handling request");

        // Liveness probes skip authorization and routing entirely.
        if path == self.health_path {
            return empty_response(StatusCode::OK);
        }

        if let Err(err) = self.auth.authorize(&path, req.headers()).await {
            tracing::info!(%path, error = %err, "request rejected by authorization prefilter");
            return plain_response(StatusCode::FORBIDDEN, ILLEGAL_REQUEST);
        }

        // First segment is the service name, the rest is forwarded as-is.
        let Some((service, rest)) = split_service_path(&path) else {
            return plain_response(StatusCode::FORBIDDEN, ILLEGAL_REQUEST);
        };

        let breaker = self.breakers.prepare(&service).await;
        breaker
            .execute(self.forward(req, &service, &rest, client_addr), |err| {
                tracing::error!(%service, error = %err, "routing failed, serving fallback");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, &self.fallback_message)
            })
            .await
    }

    /// The breaker-guarded operation: resolve, select, rewrite, forward.
    async fn forward(
        &self,
        mut req: Request<AxumBody>,
        service: &str,
        rest: &str,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, DispatchError> {
        let instances = self.cache.discover(service).await?;
        let instance = self.balance.select(&instances)?;
        tracing::debug!(%service, instance = %instance, "selected instance");

        let path_and_query = match req.uri().query() {
            Some(query) => format!("/{rest}?{query}"),
            None => format!("/{rest}"),
        };
        let target = Uri::builder()
            .scheme("http")
            .authority(instance.authority())
            .path_and_query(path_and_query)
            .build()
            .map_err(|err| DispatchError::Target(err.to_string()))?;
        *req.uri_mut() = target;

        if let Some(addr) = client_addr {
            if let Ok(value) = addr.ip().to_string().parse() {
                req.headers_mut().insert("X-Forwarded-For", value);
            }
        }

        Ok(self.http_client.send_request(req).await?)
    }
}

/// Decompose `/service/rest...` into `(service, rest)`. Returns `None` when
/// there is no service segment, which is rejected before any breaker is
/// registered.
fn split_service_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    let (service, rest) = match trimmed.split_once('/') {
        Some((service, rest)) => (service, rest),
        None => (trimmed, ""),
    };
    if service.is_empty() {
        return None;
    }
    Some((service.to_string(), rest.to_string()))
}

fn empty_response(status: StatusCode) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .body(AxumBody::empty())
        .unwrap_or_default()
}

fn plain_response(status: StatusCode, body: &str) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(AxumBody::from(body.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        core::{
            auth::PermitMatcher,
            circuit_breaker::BreakerConfig,
            instance::ServiceInstance,
            load_balancer::RandomBalance,
        },
        ports::{
            registry::{RegistryError, ServiceRegistration, ServiceRegistry},
            token_checker::{TokenCheckError, TokenChecker},
        },
    };

    struct FixedRegistry {
        instances: Vec<ServiceInstance>,
    }

    #[async_trait]
    impl ServiceRegistry for FixedRegistry {
        async fn register(&self, _: &ServiceRegistration) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn deregister(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn fetch_instances(&self, _: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
            Ok(self.instances.clone())
        }

        async fn watch_instances(
            &self,
            _: &str,
            _: u64,
        ) -> Result<(Vec<ServiceInstance>, u64), RegistryError> {
            std::future::pending().await
        }
    }

    /// Captures forwarded URIs instead of talking to the network.
    struct RecordingClient {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> Result<Response<AxumBody>, HttpClientError> {
            self.seen.lock().unwrap().push(req.uri().to_string());
            if self.fail {
                return Err(HttpClientError::ConnectionError(
                    "connection refused".into(),
                ));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(AxumBody::from("upstream says hi"))
                .unwrap())
        }
    }

    struct AllowToken;

    #[async_trait]
    impl TokenChecker for AllowToken {
        async fn check_token(&self, token: &str) -> Result<bool, TokenCheckError> {
            Ok(token == "good-token")
        }
    }

    struct PanicToken;

    #[async_trait]
    impl TokenChecker for PanicToken {
        async fn check_token(&self, _: &str) -> Result<bool, TokenCheckError> {
            panic!("token checker must not run for this request");
        }
    }

    fn handler_with(
        instances: Vec<ServiceInstance>,
        client: Arc<RecordingClient>,
        token_checker: Arc<dyn TokenChecker>,
        public: &[String],
    ) -> GatewayHandler {
        let cache = Arc::new(InstanceCache::new(
            Arc::new(FixedRegistry { instances }),
            CancellationToken::new(),
        ));
        GatewayHandler::new(
            cache,
            Arc::new(RandomBalance::new()),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(AuthFilter::new(
                PermitMatcher::new(public).unwrap(),
                token_checker,
            )),
            client,
            "/health",
            "Circuit Breaker:Service unavailable",
        )
    }

    fn recording_client(fail: bool) -> Arc<RecordingClient> {
        Arc::new(RecordingClient {
            seen: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn authed_request(uri: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, "good-token")
            .body(AxumBody::empty())
            .unwrap()
    }

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_split_service_path() {
        assert_eq!(
            split_service_path("/orders/123"),
            Some(("orders".into(), "123".into()))
        );
        assert_eq!(
            split_service_path("/orders/a/b/c"),
            Some(("orders".into(), "a/b/c".into()))
        );
        assert_eq!(
            split_service_path("/orders"),
            Some(("orders".into(), "".into()))
        );
        assert_eq!(split_service_path("/"), None);
        assert_eq!(split_service_path(""), None);
    }

    #[tokio::test]
    async fn test_health_path_short_circuits() {
        let handler = handler_with(vec![], recording_client(false), Arc::new(PanicToken), &[]);
        let response = handler
            .handle_request(
                Request::builder()
                    .uri("/health")
                    .body(AxumBody::empty())
                    .unwrap(),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_forbidden() {
        let handler = handler_with(
            vec![ServiceInstance::new("10.0.0.5", 8080)],
            recording_client(false),
            Arc::new(AllowToken),
            &[],
        );
        let response = handler
            .handle_request(
                Request::builder()
                    .uri("/orders/123")
                    .body(AxumBody::empty())
                    .unwrap(),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "illegal request!");
    }

    #[tokio::test]
    async fn test_forwards_to_selected_instance() {
        let client = recording_client(false);
        let handler = handler_with(
            vec![ServiceInstance::new("10.0.0.5", 8080)],
            client.clone(),
            Arc::new(AllowToken),
            &[],
        );
        let response = handler
            .handle_request(authed_request("/orders/123"), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "upstream says hi");
        assert_eq!(
            client.seen.lock().unwrap().as_slice(),
            ["http://10.0.0.5:8080/123"]
        );
    }

    #[tokio::test]
    async fn test_query_string_is_preserved() {
        let client = recording_client(false);
        let handler = handler_with(
            vec![ServiceInstance::new("10.0.0.5", 8080)],
            client.clone(),
            Arc::new(AllowToken),
            &[],
        );
        handler
            .handle_request(authed_request("/orders/search?q=widgets&page=2"), None)
            .await;
        assert_eq!(
            client.seen.lock().unwrap().as_slice(),
            ["http://10.0.0.5:8080/search?q=widgets&page=2"]
        );
    }

    #[tokio::test]
    async fn test_public_path_needs_no_token() {
        let client = recording_client(false);
        let handler = handler_with(
            vec![ServiceInstance::new("10.0.0.5", 8080)],
            client.clone(),
            Arc::new(PanicToken),
            &["/orders/**".to_string()],
        );
        let response = handler
            .handle_request(
                Request::builder()
                    .uri("/orders/123")
                    .body(AxumBody::empty())
                    .unwrap(),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_instances_serves_fallback() {
        let handler = handler_with(vec![], recording_client(false), Arc::new(AllowToken), &[]);
        let response = handler
            .handle_request(authed_request("/orders/123"), None)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(response).await,
            "Circuit Breaker:Service unavailable"
        );
    }

    #[tokio::test]
    async fn test_forwarding_failure_serves_fallback() {
        let client = recording_client(true);
        let handler = handler_with(
            vec![ServiceInstance::new("10.0.0.5", 8080)],
            client.clone(),
            Arc::new(AllowToken),
            &[],
        );
        let response = handler
            .handle_request(authed_request("/orders/123"), None)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(response).await,
            "Circuit Breaker:Service unavailable"
        );
    }

    #[tokio::test]
    async fn test_root_path_rejected_before_breaker_registration() {
        let handler = handler_with(
            vec![],
            recording_client(false),
            Arc::new(AllowToken),
            &["/**".to_string()],
        );
        let response = handler
            .handle_request(
                Request::builder()
                    .uri("/")
                    .body(AxumBody::empty())
                    .unwrap(),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(handler.breakers.is_empty());
    }
}
