// Error handling module
// Defines the session error taxonomy shared by the manager and HTTP client

use thiserror::Error;

/// Errors surfaced by session operations
///
/// `Clone` because a single refresh outcome is handed to every caller
/// waiting on the in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Refresh attempted with no refresh token stored
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Refresh token present but past its expiry
    #[error("Refresh token expired")]
    RefreshTokenExpired,

    /// Session endpoint refused the refresh token
    #[error("Token refresh rejected: {status} - {message}")]
    RefreshRejected { status: u16, message: String },

    /// No access token could be obtained before issuing a request
    #[error("No valid access token")]
    NoValidToken,

    /// The refresh-and-retry path of an authenticated request failed
    #[error("Session expired")]
    SessionExpired,

    /// Login endpoint refused the credentials
    #[error("Login rejected: {status} - {message}")]
    LoginRejected { status: u16, message: String },

    /// Network-level failure talking to the server
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Server answered 2xx with a body we could not use
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    /// Request could not be built (bad URL, unusable header)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Persistent token store failure
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl AuthError {
    /// True when the only way forward is a fresh login
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshToken
                | AuthError::RefreshTokenExpired
                | AuthError::RefreshRejected { .. }
                | AuthError::NoValidToken
                | AuthError::SessionExpired
                | AuthError::LoginRejected { .. }
        )
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        AuthError::Storage {
            message: format!("{:#}", err),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // Categorize the error for better debugging
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        AuthError::Transport {
            message: format!("{} (kind: {})", err, kind),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AuthError::NoRefreshToken.to_string(),
            "No refresh token available"
        );
        assert_eq!(
            AuthError::RefreshTokenExpired.to_string(),
            "Refresh token expired"
        );

        let err = AuthError::RefreshRejected {
            status: 401,
            message: "Invalid refresh token".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Token refresh rejected: 401 - Invalid refresh token"
        );

        assert_eq!(AuthError::SessionExpired.to_string(), "Session expired");
        assert_eq!(AuthError::NoValidToken.to_string(), "No valid access token");
    }

    #[test]
    fn test_requires_login() {
        assert!(AuthError::NoRefreshToken.requires_login());
        assert!(AuthError::RefreshTokenExpired.requires_login());
        assert!(AuthError::SessionExpired.requires_login());
        assert!(AuthError::NoValidToken.requires_login());
        assert!(AuthError::RefreshRejected {
            status: 400,
            message: String::new()
        }
        .requires_login());

        assert!(!AuthError::Transport {
            message: "connection refused".to_string()
        }
        .requires_login());
        assert!(!AuthError::Storage {
            message: "disk full".to_string()
        }
        .requires_login());
    }

    #[test]
    fn test_storage_error_keeps_context_chain() {
        let err = anyhow::anyhow!("database is locked").context("Failed to write tokens");
        let err = AuthError::storage(err);
        assert_eq!(
            err.to_string(),
            "Storage error: Failed to write tokens: database is locked"
        );
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = AuthError::RefreshRejected {
            status: 403,
            message: "revoked".to_string(),
        };
        assert_eq!(err.clone(), err);
    }
}
