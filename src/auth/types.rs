// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Persisted key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Persisted key for the access token expiry (RFC 3339)
pub const ACCESS_TOKEN_EXPIRES_AT_KEY: &str = "accessTokenExpiresAt";
/// Persisted key for the refresh token expiry (RFC 3339)
pub const REFRESH_TOKEN_EXPIRES_AT_KEY: &str = "refreshTokenExpiresAt";
/// Single-token key written by older clients, removed on clear
pub const LEGACY_TOKEN_KEY: &str = "token";

/// Every key owned by the session manager
pub const ALL_KEYS: [&str; 5] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    ACCESS_TOKEN_EXPIRES_AT_KEY,
    REFRESH_TOKEN_EXPIRES_AT_KEY,
    LEGACY_TOKEN_KEY,
];

/// A complete token pair as issued by the session endpoint
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// Storage entries for this pair, written as one unit
    pub(crate) fn to_entries(&self) -> [(&'static str, String); 4] {
        [
            (ACCESS_TOKEN_KEY, self.access_token.clone()),
            (REFRESH_TOKEN_KEY, self.refresh_token.clone()),
            (
                ACCESS_TOKEN_EXPIRES_AT_KEY,
                self.access_token_expires_at.to_rfc3339(),
            ),
            (
                REFRESH_TOKEN_EXPIRES_AT_KEY,
                self.refresh_token_expires_at.to_rfc3339(),
            ),
        ]
    }
}

// Hide token values in Debug output
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish()
    }
}

/// Token state as read back from storage; any field may be missing
#[derive(Clone, Default, PartialEq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl StoredTokens {
    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.access_token_expires_at.is_none()
            && self.refresh_token_expires_at.is_none()
    }

    /// Access token counts as expired once `now` is within `skew` of expiry
    pub fn access_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.access_token_expires_at {
            None => true, // No expiration info, assume refresh needed
            Some(exp) => now >= exp - skew,
        }
    }

    /// Refresh token expiry has no skew margin
    pub fn refresh_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.refresh_token_expires_at {
            None => true,
            Some(exp) => now >= exp,
        }
    }

    /// When the proactive refresh should run for the stored access token
    pub fn refresh_due_at(&self, skew: Duration) -> Option<DateTime<Utc>> {
        self.access_token_expires_at.map(|exp| exp - skew)
    }

    /// Lifecycle state of the stored access token
    pub fn state_at(&self, now: DateTime<Utc>, skew: Duration) -> TokenState {
        if self.access_token.is_none() {
            return TokenState::Missing;
        }
        match self.access_token_expires_at {
            None => TokenState::Expired,
            Some(exp) if now >= exp => TokenState::Expired,
            Some(exp) if now >= exp - skew => TokenState::ExpiringSoon,
            Some(_) => TokenState::Valid,
        }
    }
}

impl From<TokenPair> for StoredTokens {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: Some(pair.access_token),
            refresh_token: Some(pair.refresh_token),
            access_token_expires_at: Some(pair.access_token_expires_at),
            refresh_token_expires_at: Some(pair.refresh_token_expires_at),
        }
    }
}

impl fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredTokens")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish()
    }
}

/// Access token lifecycle, from the manager's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Nothing stored; equivalent to logged out
    Missing,
    Valid,
    /// Inside the skew margin; proactive refresh fires here
    ExpiringSoon,
    Expired,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenState::Missing => "missing",
            TokenState::Valid => "valid",
            TokenState::ExpiringSoon => "expiring soon",
            TokenState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Platform role sent with a login request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Student,
    Mentor,
    Admin,
    SuperAdmin,
}

/// Session refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Body of a successful refresh or login response
#[derive(Deserialize)]
pub struct SessionEnvelope {
    pub session: Option<TokenPair>,
    #[serde(default)]
    pub user: Option<serde_json::Value>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
}

/// Error body returned by the platform API
#[derive(Deserialize, Default)]
pub struct ErrorBody {
    pub error: Option<String>,
    pub code: Option<String>,
}

/// Parse a persisted timestamp, accepting both `Z` and offset suffixes
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
