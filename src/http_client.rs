use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::auth::refresh::{self, SESSION_PATH};
use crate::auth::SessionTokenManager;
use crate::error::{AuthError, Result};

/// Error code a protected endpoint sends with 401 when the access token has expired
pub const TOKEN_EXPIRED_CODE: &str = "TOKEN_EXPIRED";

/// HTTP client for authenticated platform requests
/// Attaches the bearer token and retries once when the server reports it expired
pub struct SessionHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session token manager
    manager: SessionTokenManager,
}

/// An outgoing authenticated request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// `url` may be absolute or a path such as `/api/classes`
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Send `body` as JSON
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A fully buffered response
///
/// Buffered so that a 401 can be inspected and still handed back intact.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// 401 with `{ "code": "TOKEN_EXPIRED" }`; other 401s do not qualify
    pub fn is_token_expired(&self) -> bool {
        #[derive(Deserialize)]
        struct CodeBody {
            code: Option<String>,
        }

        self.status == StatusCode::UNAUTHORIZED
            && self
                .json::<CodeBody>()
                .ok()
                .and_then(|b| b.code)
                .as_deref()
                == Some(TOKEN_EXPIRED_CODE)
    }
}

/// Body of `GET /api/auth/session`
#[derive(Deserialize)]
struct SessionCheckBody {
    #[serde(default)]
    success: bool,
    user: Option<serde_json::Value>,
}

impl SessionHttpClient {
    /// Create a new HTTP client
    pub fn new(
        manager: SessionTokenManager,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(refresh::user_agent())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, manager })
    }

    pub fn manager(&self) -> &SessionTokenManager {
        &self.manager
    }

    /// Execute an authenticated request
    ///
    /// - no usable token: `NoValidToken`
    /// - 401 `TOKEN_EXPIRED`: refresh and retry exactly once; `SessionExpired` if the refresh fails
    /// - anything else: returned as-is
    pub async fn api_request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let access_token = self
            .manager
            .get_valid_access_token()
            .await
            .ok_or(AuthError::NoValidToken)?;

        let url = self.resolve(&request.url)?;
        tracing::debug!(method = %request.method, url = %url, "Sending authenticated request");

        let response = self.send(&request, &url, &access_token).await?;
        if !response.is_token_expired() {
            return Ok(response);
        }

        tracing::warn!(url = %url, "Access token expired, refreshing and retrying once");

        let access_token = match self.manager.refresh_access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("Token refresh for retry failed: {}", e);
                return Err(AuthError::SessionExpired);
            }
        };

        self.send(&request, &url, &access_token).await
    }

    async fn send(&self, request: &ApiRequest, url: &Url, access_token: &str) -> Result<ApiResponse> {
        // The session token always wins over a caller-supplied Authorization
        let mut headers = request.headers.clone();
        headers.remove(AUTHORIZATION);

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .bearer_auth(access_token);

        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "HTTP request error");
            AuthError::from(e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        tracing::debug!(status = %status, "Received HTTP response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Absolute URLs pass through; paths resolve against the platform base URL
    fn resolve(&self, url: &str) -> Result<Url> {
        self.manager
            .base_url()
            .join(url)
            .map_err(|e| AuthError::InvalidRequest {
                message: format!("Invalid URL '{}': {}", url, e),
            })
    }

    /// Ask the server who the current session belongs to
    ///
    /// `None` when logged out, rejected, or on any error.
    pub async fn check_session(&self) -> Option<serde_json::Value> {
        let response = match self.api_request(ApiRequest::get(SESSION_PATH)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Session check error: {}", e);
                return None;
            }
        };

        match response.json::<SessionCheckBody>() {
            Ok(body) if response.is_success() && body.success => body.user,
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Session check error: {}", e);
                None
            }
        }
    }

    /// End the session on the server, then always clear local tokens
    pub async fn logout(&self) {
        if let Err(e) = self.api_request(ApiRequest::delete(SESSION_PATH)).await {
            tracing::error!("Logout error: {}", e);
        }
        self.manager.clear_tokens();
        tracing::info!("Logged out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;

    fn client() -> SessionHttpClient {
        let manager = SessionTokenManager::new(
            MemoryTokenStore::new(),
            Url::parse("https://daksh.example.com/").unwrap(),
            300,
        )
        .unwrap();
        SessionHttpClient::new(manager, 30, 60).unwrap()
    }

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = client();

        assert_eq!(
            client.resolve("/api/classes").unwrap().as_str(),
            "https://daksh.example.com/api/classes"
        );
        assert_eq!(
            client.resolve("https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
        assert!(matches!(
            client.resolve("http://[::1"),
            Err(AuthError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_token_expired_detection() {
        assert!(response(401, r#"{"code":"TOKEN_EXPIRED"}"#).is_token_expired());
        assert!(!response(401, r#"{"code":"INVALID_TOKEN"}"#).is_token_expired());
        assert!(!response(401, r#"{"error":"No token provided"}"#).is_token_expired());
        assert!(!response(401, "").is_token_expired());
        assert!(!response(403, r#"{"code":"TOKEN_EXPIRED"}"#).is_token_expired());
    }

    #[test]
    fn test_api_request_builder() {
        let request = ApiRequest::post("/api/posts")
            .json(serde_json::json!({ "title": "hello" }))
            .header(
                HeaderName::from_static("x-client"),
                HeaderValue::from_static("cli"),
            );

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.url(), "/api/posts");
        assert_eq!(request.headers.get("x-client").unwrap(), "cli");
        assert_eq!(request.body.unwrap()["title"], "hello");
    }

    #[test]
    fn test_response_accessors() {
        let response = response(200, r#"{"success":true}"#);
        assert!(response.is_success());
        assert_eq!(response.text(), r#"{"success":true}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["success"], true);
    }
}
