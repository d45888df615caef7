// Session endpoint calls: token refresh and login

use reqwest::{Client, Url};

use super::types::{ErrorBody, LoginRequest, RefreshRequest, SessionEnvelope, TokenPair, UserRole};
use crate::error::{AuthError, Result};

/// Path of the session endpoint, relative to the platform base URL
pub const SESSION_PATH: &str = "/api/auth/session";

/// Path of the credential login endpoint
pub const LOGIN_PATH: &str = "/api/auth/login";

/// Resolve an endpoint path against the platform base URL
pub fn endpoint(base_url: &Url, path: &str) -> Result<Url> {
    base_url.join(path).map_err(|e| AuthError::InvalidRequest {
        message: format!("Cannot build URL for {}: {}", path, e),
    })
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// User-Agent sent with every request from this client
pub fn user_agent() -> String {
    format!(
        "daksh-session/{}-{}",
        env!("CARGO_PKG_VERSION"),
        get_machine_fingerprint()
    )
}

/// Pull the server's `error` message out of a failure body
fn error_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| fallback.to_string())
}

/// Exchange a refresh token for a new token pair
///
/// `PUT /api/auth/session` with `{ refreshToken }`.
pub async fn refresh_session(client: &Client, base_url: &Url, refresh_token: &str) -> Result<TokenPair> {
    let url = endpoint(base_url, SESSION_PATH)?;
    tracing::debug!(url = %url, "Sending session refresh request");

    let response = client
        .put(url)
        .header("User-Agent", user_agent())
        .json(&RefreshRequest { refresh_token })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        let message = error_message(&error_text, "Failed to refresh token");
        tracing::error!(status = status.as_u16(), error = %message, "Session refresh rejected");
        return Err(AuthError::RefreshRejected {
            status: status.as_u16(),
            message,
        });
    }

    let envelope: SessionEnvelope = response.json().await.map_err(|e| AuthError::InvalidResponse {
        message: format!("Failed to parse session refresh response: {}", e),
    })?;

    let pair = envelope.session.ok_or_else(|| AuthError::InvalidResponse {
        message: "Session refresh response does not contain a session".to_string(),
    })?;

    if pair.access_token.is_empty() {
        return Err(AuthError::InvalidResponse {
            message: "Session refresh response does not contain accessToken".to_string(),
        });
    }

    tracing::info!(
        "Session refreshed, access token expires: {}",
        pair.access_token_expires_at.to_rfc3339()
    );

    Ok(pair)
}

/// Log in with username and password
///
/// Returns the issued token pair and the user record, if the server sent one.
pub async fn login(
    client: &Client,
    base_url: &Url,
    username: &str,
    password: &str,
    role: Option<UserRole>,
) -> Result<(TokenPair, Option<serde_json::Value>)> {
    let url = endpoint(base_url, LOGIN_PATH)?;
    tracing::info!(username = %username, role = ?role, "Logging in");

    let response = client
        .post(url)
        .header("User-Agent", user_agent())
        .json(&LoginRequest {
            username,
            password,
            role,
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        let message = error_message(&error_text, "Login failed");
        tracing::warn!(status = status.as_u16(), error = %message, "Login rejected");
        return Err(AuthError::LoginRejected {
            status: status.as_u16(),
            message,
        });
    }

    let envelope: SessionEnvelope = response.json().await.map_err(|e| AuthError::InvalidResponse {
        message: format!("Failed to parse login response: {}", e),
    })?;

    let pair = envelope.session.ok_or_else(|| AuthError::InvalidResponse {
        message: "Login response does not contain a session".to_string(),
    })?;

    Ok((pair, envelope.user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SESSION_BODY: &str = r#"{
        "session": {
            "accessToken": "new-access",
            "refreshToken": "new-refresh",
            "accessTokenExpiresAt": "2030-01-01T00:15:00.000Z",
            "refreshTokenExpiresAt": "2030-01-31T00:00:00.000Z"
        }
    }"#;

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":"Invalid refresh token"}"#, "fallback"),
            "Invalid refresh token"
        );
        assert_eq!(error_message("Bad Gateway", "fallback"), "Bad Gateway");
        assert_eq!(error_message("", "fallback"), "fallback");
        assert_eq!(error_message(r#"{"code":"X"}"#, "fallback"), r#"{"code":"X"}"#);
    }

    #[test]
    fn test_endpoint_join() {
        let base = Url::parse("https://daksh.example.com/").unwrap();
        assert_eq!(
            endpoint(&base, SESSION_PATH).unwrap().as_str(),
            "https://daksh.example.com/api/auth/session"
        );
    }

    #[test]
    fn test_user_agent_format() {
        let ua = user_agent();
        assert!(ua.starts_with(&format!("daksh-session/{}-", env!("CARGO_PKG_VERSION"))));
    }

    #[tokio::test]
    async fn test_refresh_session_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", SESSION_PATH)
            .match_body(mockito::Matcher::Json(json!({ "refreshToken": "old-refresh" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(SESSION_BODY)
            .create_async()
            .await;

        let base = Url::parse(&server.url()).unwrap();
        let pair = refresh_session(&Client::new(), &base, "old-refresh")
            .await
            .unwrap();

        assert_eq!(pair.access_token, "new-access");
        assert_eq!(pair.refresh_token, "new-refresh");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_session_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", SESSION_PATH)
            .with_status(401)
            .with_body(r#"{"error":"Invalid refresh token"}"#)
            .create_async()
            .await;

        let base = Url::parse(&server.url()).unwrap();
        let err = refresh_session(&Client::new(), &base, "revoked")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AuthError::RefreshRejected {
                status: 401,
                message: "Invalid refresh token".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_session_without_session_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", SESSION_PATH)
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let base = Url::parse(&server.url()).unwrap();
        let err = refresh_session(&Client::new(), &base, "r")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_login_returns_pair_and_user() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", LOGIN_PATH)
            .match_body(mockito::Matcher::Json(json!({
                "username": "asha",
                "password": "pw",
                "role": "STUDENT"
            })))
            .with_status(200)
            .with_body(
                json!({
                    "success": true,
                    "user": { "username": "asha", "role": "STUDENT" },
                    "session": {
                        "accessToken": "a1",
                        "refreshToken": "r1",
                        "accessTokenExpiresAt": "2030-01-01T00:15:00Z",
                        "refreshTokenExpiresAt": "2030-01-31T00:00:00Z"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let base = Url::parse(&server.url()).unwrap();
        let (pair, user) = login(&Client::new(), &base, "asha", "pw", Some(UserRole::Student))
            .await
            .unwrap();

        assert_eq!(pair.access_token, "a1");
        assert_eq!(user.unwrap()["username"], "asha");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(401)
            .with_body(r#"{"error":"Invalid username or password"}"#)
            .create_async()
            .await;

        let base = Url::parse(&server.url()).unwrap();
        let err = login(&Client::new(), &base, "asha", "wrong", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AuthError::LoginRejected {
                status: 401,
                message: "Invalid username or password".to_string()
            }
        );
    }
}
