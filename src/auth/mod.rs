// Authentication module
// Manages the session token lifecycle and its persistent storage

mod manager;
pub mod refresh;
pub mod resume;
pub mod store;
pub mod types;

pub use manager::{SessionTokenManager, MAX_REFRESH_SKEW_SECS};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
pub use types::{StoredTokens, TokenPair, TokenState, UserRole};
