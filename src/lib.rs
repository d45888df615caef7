// Daksh session client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{SessionTokenManager, StoredTokens, TokenPair};
pub use error::{AuthError, Result};
pub use http_client::{ApiRequest, ApiResponse, SessionHttpClient};
