//! OAuth Dynamic Client Registration with a JWT-SVID software statement.
//!
//! Targets Keycloak's `spiffe-dcr` client-registration provider. The request
//! is sent once: a rejection reflects the server's policy, and sending the
//! same statement again would not change it.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::spiffe::Credential;

/// Grant requested for every registered client.
pub const GRANT_TYPE: &str = "client_credentials";

/// Scope requested for every registered client.
pub const SCOPE: &str = "spiffe:workload";

/// Errors from the registration exchange.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("registration endpoint {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("registration rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport failure: no HTTP response was received.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// HTTP operations used by the flow.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        read_response(response).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError(e.to_string()))?;
    Ok(HttpResponse { status, body })
}

/// `{base}/realms/{realm}`
pub fn realm_url(base_url: &str, realm: &str) -> String {
    format!("{}/realms/{}", base_url.trim_end_matches('/'), realm)
}

/// `{base}/realms/{realm}/clients-registrations/spiffe-dcr/register`
pub fn registration_endpoint(base_url: &str, realm: &str) -> String {
    format!(
        "{}/clients-registrations/spiffe-dcr/register",
        realm_url(base_url, realm)
    )
}

/// Body of the registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcrRequest {
    pub software_statement: String,
    pub client_name: String,
    pub grant_types: Vec<String>,
    pub scope: String,
}

impl DcrRequest {
    pub fn new(statement: Credential, client_name: &str) -> Self {
        Self {
            software_statement: statement.into_inner(),
            client_name: client_name.to_string(),
            grant_types: vec![GRANT_TYPE.to_string()],
            scope: SCOPE.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "software_statement": self.software_statement,
            "client_name": self.client_name,
            "grant_types": self.grant_types,
            "scope": self.scope,
        })
    }
}

/// Outcome of a registration exchange that received an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub success: bool,
    pub http_status: u16,
    /// Response body; pretty-printed when it is JSON.
    pub body: String,
}

impl RegistrationResult {
    /// HTTP 201 is the only accepted status.
    pub fn from_response(response: HttpResponse) -> Self {
        Self {
            success: response.status == 201,
            http_status: response.status,
            body: pretty_body(&response.body),
        }
    }

    /// The result if the client was registered, [`RequestError::Rejected`] otherwise.
    pub fn into_accepted(self) -> Result<Self, RequestError> {
        if self.success {
            Ok(self)
        } else {
            Err(RequestError::Rejected {
                status: self.http_status,
                body: self.body,
            })
        }
    }

    /// The registered `client_id`, if the body carries one.
    pub fn client_id(&self) -> Option<String> {
        serde_json::from_str::<Value>(&self.body)
            .ok()?
            .get("client_id")?
            .as_str()
            .map(String::from)
    }
}

fn pretty_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| body.to_string())
}

/// Registration requester.
pub struct DcrClient<'a> {
    http: &'a dyn HttpClient,
}

impl<'a> DcrClient<'a> {
    pub fn new(http: &'a dyn HttpClient) -> Self {
        Self { http }
    }

    /// Submit `statement` for registration as `client_name` at `endpoint`.
    pub async fn register(
        &self,
        statement: Credential,
        client_name: &str,
        endpoint: &str,
    ) -> Result<RegistrationResult, RequestError> {
        let request = DcrRequest::new(statement, client_name);
        let body = request.to_json();

        info!(endpoint = %endpoint, client_name = %client_name, "Submitting DCR request");

        let response =
            self.http
                .post_json(endpoint, &body)
                .await
                .map_err(|e| RequestError::Unreachable {
                    url: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

        let result = RegistrationResult::from_response(response);
        if result.success {
            info!(
                status = result.http_status,
                client_id = result.client_id().as_deref().unwrap_or("unknown"),
                "DCR request accepted"
            );
        } else {
            warn!(status = result.http_status, body = %result.body, "DCR request rejected");
        }

        Ok(result)
    }

    /// GET the realm; reachable when the server answers 2xx.
    pub async fn probe_realm(&self, base_url: &str, realm: &str) -> Result<(), TransportError> {
        let url = realm_url(base_url, realm);
        let response = self.http.get(&url).await?;

        if (200..300).contains(&response.status) {
            debug!(url = %url, status = response.status, "Realm is reachable");
            Ok(())
        } else {
            Err(TransportError(format!("HTTP {}", response.status)))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeHttp;
    use super::*;

    const ENDPOINT: &str =
        "http://localhost:8080/realms/spiffe/clients-registrations/spiffe-dcr/register";

    fn statement(raw: &str) -> Credential {
        Credential::parse(raw).unwrap()
    }

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            registration_endpoint("http://localhost:8080/", "spiffe"),
            ENDPOINT
        );
        assert_eq!(
            realm_url("http://localhost:8080", "spiffe"),
            "http://localhost:8080/realms/spiffe"
        );
    }

    #[tokio::test]
    async fn test_register_created() {
        let http = FakeHttp::default().route(ENDPOINT, 201, r#"{"client_id":"x"}"#);

        let result = DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.http_status, 201);
        assert_eq!(result.client_id().as_deref(), Some("x"));
    }

    #[test]
    fn test_request_body() {
        let request = DcrRequest::new(statement("abc.def.ghi"), "workload");
        let body = request.to_json();

        assert_eq!(body["software_statement"], "abc.def.ghi");
        assert_eq!(body["grant_types"], json!([GRANT_TYPE]));
        assert_eq!(body.as_object().map(|o| o.len()), Some(4));
    }

    #[tokio::test]
    async fn test_register_submits_statement_verbatim() {
        let http = FakeHttp::default().route(ENDPOINT, 201, "{}");

        DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await
            .unwrap();

        let posts = http.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, ENDPOINT);
        assert_eq!(
            posts[0].1,
            json!({
                "software_statement": "abc.def.ghi",
                "client_name": "workload",
                "grant_types": ["client_credentials"],
                "scope": "spiffe:workload",
            })
        );
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let http =
            FakeHttp::default().route(ENDPOINT, 400, r#"{"error":"invalid_software_statement"}"#);

        let result = DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.http_status, 400);
        assert_eq!(
            result.body,
            "{\n  \"error\": \"invalid_software_statement\"\n}"
        );

        match result.into_accepted() {
            Err(RequestError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_software_statement"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_non_json_body_kept_verbatim() {
        let http = FakeHttp::default().route(ENDPOINT, 500, "Internal Server Error");

        let result = DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.body, "Internal Server Error");
    }

    #[tokio::test]
    async fn test_register_200_is_not_success() {
        let http = FakeHttp::default().route(ENDPOINT, 200, "{}");

        let result = DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_register_unreachable() {
        let http = FakeHttp::default();

        let result = DcrClient::new(&http)
            .register(statement("abc.def.ghi"), "workload", ENDPOINT)
            .await;
        assert!(matches!(result, Err(RequestError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_probe_realm() {
        let http = FakeHttp::default()
            .route("http://localhost:8080/realms/spiffe", 200, "{}")
            .route("http://localhost:8080/realms/missing", 404, "");
        let client = DcrClient::new(&http);

        assert!(client.probe_realm("http://localhost:8080", "spiffe").await.is_ok());
        assert!(client.probe_realm("http://localhost:8080", "missing").await.is_err());
        assert!(client.probe_realm("http://localhost:9999", "spiffe").await.is_err());
    }

    #[tokio::test]
    async fn test_reqwest_client_against_local_server() {
        use axum::{
            http::StatusCode,
            routing::{get, post},
            Json, Router,
        };

        let app = Router::new()
            .route("/realms/spiffe", get(|| async { "{}" }))
            .route(
                "/realms/spiffe/clients-registrations/spiffe-dcr/register",
                post(|Json(body): Json<Value>| async move {
                    if body["software_statement"] == "abc.def.ghi" {
                        (StatusCode::CREATED, Json(json!({"client_id": "x"})))
                    } else {
                        (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "invalid_software_statement"})),
                        )
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = ReqwestClient::new();
        let client = DcrClient::new(&http);
        let endpoint = registration_endpoint(&base, "spiffe");

        client.probe_realm(&base, "spiffe").await.unwrap();

        let accepted = client
            .register(statement("abc.def.ghi"), "workload", &endpoint)
            .await
            .unwrap();
        assert!(accepted.success);
        assert_eq!(accepted.http_status, 201);

        let rejected = client
            .register(statement("xyz.def.ghi"), "workload", &endpoint)
            .await
            .unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.http_status, 400);
        assert!(rejected.body.contains("invalid_software_statement"));
    }
}
