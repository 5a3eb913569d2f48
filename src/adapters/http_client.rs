use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Forwarding client built on Hyper with Rustls (HTTP/1.1, h2 via ALPN).
///
/// The dispatcher hands this adapter a request whose URI already names the
/// selected instance; the adapter pins the Host header to that authority,
/// sends the request, and returns the instance's response with its framing
/// headers normalized. No deadline is applied here: the circuit breaker
/// owns the per-request clock.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|authority| authority.to_string())
            .ok_or_else(|| {
                HttpClientError::InvalidRequest(format!("outgoing URI has no host: {}", req.uri()))
            })?;

        let host_header = HeaderValue::from_str(&authority)
            .map_err(|err| HttpClientError::InvalidRequest(err.to_string()))?;
        req.headers_mut().insert(header::HOST, host_header);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        tracing::debug!(
            method = %outgoing.method(),
            uri = %outgoing.uri(),
            "forwarding request to instance"
        );

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed on the way back out; drop the
                // upstream transfer encoding.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(err) => Err(HttpClientError::ConnectionError(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[tokio::test]
    async fn test_request_without_host_is_rejected() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("/relative/only")
            .body(AxumBody::empty())
            .unwrap();

        let err = client.send_request(req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_a_connection_error() {
        let client = HttpClientAdapter::new().unwrap();
        // Reserved TEST-NET address, nothing listens there.
        let req = Request::builder()
            .uri("http://192.0.2.1:9/x")
            .body(AxumBody::empty())
            .unwrap();

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(30), client.send_request(req))
                .await;
        if let Ok(inner) = result {
            assert!(matches!(inner, Err(HttpClientError::ConnectionError(_))));
        }
    }
}
