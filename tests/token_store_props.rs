// Property tests for persisting token pairs

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use reqwest::Url;

use daksh_session::auth::{SessionTokenManager, SqliteTokenStore};
use daksh_session::{StoredTokens, TokenPair};

fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    // 2001-09-09 .. 2128-06-24, with sub-second precision
    (1_000_000_000i64..5_000_000_000i64, 0u32..1_000_000_000u32)
        .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap())
}

fn token_pair() -> impl Strategy<Value = TokenPair> {
    (
        "[A-Za-z0-9._-]{1,64}",
        "[A-Za-z0-9._-]{1,64}",
        timestamp(),
        timestamp(),
    )
        .prop_map(|(access, refresh, access_exp, refresh_exp)| TokenPair {
            access_token: access,
            refresh_token: refresh,
            access_token_expires_at: access_exp,
            refresh_token_expires_at: refresh_exp,
        })
}

fn manager() -> SessionTokenManager {
    let store = SqliteTokenStore::open_in_memory().unwrap();
    SessionTokenManager::new(store, Url::parse("http://127.0.0.1:9/").unwrap(), 300).unwrap()
}

proptest! {
    #[test]
    fn set_then_get_returns_the_same_pair(pair in token_pair()) {
        let manager = manager();
        manager.set_tokens(&pair).unwrap();
        prop_assert_eq!(manager.get_tokens(), StoredTokens::from(pair));
    }

    #[test]
    fn last_write_wins(first in token_pair(), second in token_pair()) {
        let manager = manager();
        manager.set_tokens(&first).unwrap();
        manager.set_tokens(&second).unwrap();
        prop_assert_eq!(manager.get_tokens(), StoredTokens::from(second));
    }

    #[test]
    fn clear_always_empties(pair in token_pair()) {
        let manager = manager();
        manager.set_tokens(&pair).unwrap();
        manager.clear_tokens();
        prop_assert!(manager.get_tokens().is_empty());
        prop_assert!(manager.is_access_token_expired());
        prop_assert!(manager.is_refresh_token_expired());
    }
}
