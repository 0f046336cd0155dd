//! HTTP client for the Proxmox VE API.
//!
//! Endpoints are supplied as a list; every call picks one at random, so a
//! dead node only fails a fraction of requests and the next tick retries
//! elsewhere. Writes are form-encoded; responses are wrapped in a
//! `{"data": ...}` envelope and errors in `{"status", "error"}`.

use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{ApiData, ApiErrorBody};
use crate::error::{CrsError, CrsResult};

const API_BASE: &str = "api2/json";

/// Connection settings for [`PveClient`].
#[derive(Debug, Clone)]
pub struct PveConfig {
    /// Base URLs of cluster nodes, e.g. `https://pve1.example.com:8006`.
    pub endpoints: Vec<String>,
    /// API token in `user@realm!tokenid=secret` form.
    pub api_token: String,
    /// Skip TLS certificate verification.
    pub insecure_tls: bool,
    pub timeout: Duration,
}

impl Default for PveConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            api_token: String::new(),
            insecure_tls: false,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct PveClient {
    config: PveConfig,
    http: reqwest::Client,
}

impl PveClient {
    pub fn new(config: PveConfig) -> CrsResult<Self> {
        if config.endpoints.is_empty() {
            return Err(CrsError::Config("no API endpoints configured".to_string()));
        }
        if config.api_token.is_empty() {
            return Err(CrsError::Config("no API token configured".to_string()));
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .timeout(config.timeout)
            .build()
            .map_err(|e| CrsError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    fn build_url(&self, path: &str) -> String {
        // One endpoint per call, chosen at random.
        let endpoint = self
            .config
            .endpoints
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_default();
        format!("{}/{}/{}", endpoint.trim_end_matches('/'), API_BASE, path)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CrsResult<T> {
        self.request(Method::GET, path, None).await
    }

    pub(crate) async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> CrsResult<T> {
        self.request(Method::POST, path, Some(form)).await
    }

    pub(crate) async fn put_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> CrsResult<T> {
        self.request(Method::PUT, path, Some(form)).await
    }

    pub(crate) async fn delete<T: DeserializeOwned>(&self, path: &str) -> CrsResult<T> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> CrsResult<T> {
        let url = self.build_url(path);
        debug!(method = %method, url = %url, "sending API request");

        // The Authorization header must never reach the logs.
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("PVEAPIToken={}", self.config.api_token),
            );
        if let Some(form) = form {
            builder = builder.form(form);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            debug!(
                method = %method,
                url = %url,
                status = %status,
                body = %String::from_utf8_lossy(&body),
                "API request failed"
            );
            return Err(Self::api_error(status, &body));
        }

        debug!(
            method = %method,
            url = %url,
            status = %status,
            body = %String::from_utf8_lossy(&body),
            "API request complete"
        );

        // Writes may return an empty body; decode it as a null payload.
        let envelope: ApiData<T> = if body.is_empty() {
            serde_json::from_str("{\"data\": null}")
                .map_err(|e| CrsError::serialization(format!("decode {path} response"), e))?
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| CrsError::serialization(format!("decode {path} response"), e))?
        };
        Ok(envelope.data)
    }

    fn api_error(status: StatusCode, body: &[u8]) -> CrsError {
        match serde_json::from_slice::<ApiErrorBody>(body) {
            Ok(parsed) => CrsError::Api {
                status: if parsed.status != 0 {
                    parsed.status
                } else {
                    status.as_u16()
                },
                message: if parsed.error.is_empty() {
                    String::from_utf8_lossy(body).into_owned()
                } else {
                    parsed.error
                },
            },
            Err(_) => CrsError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxmox::types::Node;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client_for(server: &Server) -> PveClient {
        PveClient::new(PveConfig {
            endpoints: vec![format!("http://{}", server.addr())],
            api_token: "crs@pve!scheduler=secret".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn get_sends_token_and_unwraps_envelope() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api2/json/nodes"),
                request::headers(contains((
                    "authorization",
                    "PVEAPIToken=crs@pve!scheduler=secret"
                ))),
            ])
            .respond_with(json_encoded(json!({
                "data": [{"node": "pve1", "status": "online"}]
            }))),
        );

        let client = client_for(&server);
        let nodes: Vec<Node> = client.get_json("nodes").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node, "pve1");
    }

    #[tokio::test]
    async fn error_body_maps_to_api_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api2/json/cluster/options"))
                .respond_with(
                    status_code(403)
                        .body(r#"{"status": 403, "error": "permission denied"}"#),
                ),
        );

        let client = client_for(&server);
        let err = client
            .get_json::<serde_json::Value>("cluster/options")
            .await
            .unwrap_err();
        match err {
            CrsError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_error_body_keeps_raw_text() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api2/json/storage"))
                .respond_with(status_code(500).body("upstream blew up")),
        );

        let client = client_for(&server);
        let err = client
            .get_json::<serde_json::Value>("storage")
            .await
            .unwrap_err();
        match err {
            CrsError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream blew up");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_with_empty_body_succeeds() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api2/json/cluster/ha/groups"))
                .respond_with(status_code(200)),
        );

        let client = client_for(&server);
        let form = vec![("group".to_string(), "crs-vm-pin-pve1".to_string())];
        let result: Option<serde_json::Value> =
            client.post_form("cluster/ha/groups", &form).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn missing_endpoints_is_a_config_error() {
        let err = PveClient::new(PveConfig {
            api_token: "t".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CrsError::Config(_)));
    }
}
