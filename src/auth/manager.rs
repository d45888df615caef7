use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use super::refresh;
use super::store::TokenStore;
use super::types::{
    parse_datetime, StoredTokens, TokenPair, UserRole, ACCESS_TOKEN_EXPIRES_AT_KEY,
    ACCESS_TOKEN_KEY, ALL_KEYS, REFRESH_TOKEN_EXPIRES_AT_KEY, REFRESH_TOKEN_KEY,
};
use crate::error::{AuthError, Result};

type RefreshFuture = Shared<BoxFuture<'static, Result<String>>>;

/// Largest accepted refresh skew (one week)
pub const MAX_REFRESH_SKEW_SECS: u64 = 7 * 24 * 3600;

/// Session token manager
/// Owns the persisted token pair, the in-flight refresh and the proactive refresh timer
///
/// Cheap to clone; clones share the same state. Create one per running client.
#[derive(Clone)]
pub struct SessionTokenManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    /// Persisted token pair; every read and write goes through this lock
    store: Mutex<Box<dyn TokenStore>>,

    /// HTTP client for session endpoint calls
    client: Client,

    /// Platform base URL
    base_url: Url,

    /// Safety margin subtracted from access token expiry (default: 5 minutes)
    refresh_skew: Duration,

    /// The single outstanding refresh, if any
    in_flight: Mutex<Option<InFlightRefresh>>,

    /// The single armed proactive refresh, if any
    timer: Mutex<Option<ScheduledRefresh>>,

    next_id: AtomicU64,
}

struct InFlightRefresh {
    id: u64,
    refresh: RefreshFuture,
}

struct ScheduledRefresh {
    id: u64,
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.take() {
            timer.handle.abort();
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionTokenManager {
    /// Create a manager with its own HTTP client
    pub fn new(
        store: impl TokenStore + 'static,
        base_url: Url,
        refresh_skew_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Self::with_client(store, client, base_url, refresh_skew_secs)
    }

    /// Create a manager that reuses an existing HTTP client
    pub fn with_client(
        store: impl TokenStore + 'static,
        client: Client,
        base_url: Url,
        refresh_skew_secs: u64,
    ) -> anyhow::Result<Self> {
        if refresh_skew_secs > MAX_REFRESH_SKEW_SECS {
            anyhow::bail!(
                "Refresh skew of {}s exceeds the maximum of {}s",
                refresh_skew_secs,
                MAX_REFRESH_SKEW_SECS
            );
        }
        let refresh_skew = i64::try_from(refresh_skew_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .with_context(|| format!("Invalid refresh skew: {}s", refresh_skew_secs))?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                store: Mutex::new(Box::new(store)),
                client,
                base_url,
                refresh_skew,
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn refresh_skew(&self) -> Duration {
        self.inner.refresh_skew
    }

    /// Read the persisted tokens; missing or unreadable fields come back empty
    pub fn get_tokens(&self) -> StoredTokens {
        let store = lock(&self.inner.store);

        let read = |key: &str| match store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::error!("Error getting tokens: {:#}", e);
                None
            }
        };

        StoredTokens {
            access_token: read(ACCESS_TOKEN_KEY),
            refresh_token: read(REFRESH_TOKEN_KEY),
            access_token_expires_at: read(ACCESS_TOKEN_EXPIRES_AT_KEY)
                .and_then(|s| parse_datetime(&s)),
            refresh_token_expires_at: read(REFRESH_TOKEN_EXPIRES_AT_KEY)
                .and_then(|s| parse_datetime(&s)),
        }
    }

    /// Persist a full token pair and re-arm the proactive refresh
    pub fn set_tokens(&self, pair: &TokenPair) -> Result<()> {
        let entries = pair.to_entries();
        let entries: Vec<(&str, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();

        lock(&self.inner.store)
            .set_many(&entries)
            .context("Error storing tokens")
            .map_err(AuthError::storage)?;

        tracing::debug!(
            "Stored tokens, access token expires: {}",
            pair.access_token_expires_at.to_rfc3339()
        );

        self.schedule_token_refresh();
        Ok(())
    }

    /// Delete every persisted token and cancel the proactive refresh
    pub fn clear_tokens(&self) {
        if let Err(e) = lock(&self.inner.store).remove_many(&ALL_KEYS) {
            tracing::error!("Error clearing tokens: {:#}", e);
        }
        self.cancel_scheduled_refresh();
        tracing::debug!("Cleared stored tokens");
    }

    /// Check if access token is expired or expiring within the skew margin
    pub fn is_access_token_expired(&self) -> bool {
        self.get_tokens()
            .access_expired_at(Utc::now(), self.inner.refresh_skew)
    }

    /// Check if refresh token is expired
    pub fn is_refresh_token_expired(&self) -> bool {
        self.get_tokens().refresh_expired_at(Utc::now())
    }

    /// Refresh the access token
    ///
    /// At most one refresh call is outstanding at a time; callers arriving
    /// while one is pending wait for it and receive its result. Any failure
    /// clears the stored tokens.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let refresh = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(pending) => {
                    tracing::debug!("Token refresh already in flight, waiting for it");
                    pending.refresh.clone()
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let refresh = self.spawn_refresh(id);
                    *slot = Some(InFlightRefresh {
                        id,
                        refresh: refresh.clone(),
                    });
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Run the refresh on its own task so that a caller going away
    /// cannot abandon a half-finished token rotation
    fn spawn_refresh(&self, id: u64) -> RefreshFuture {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let result = manager.perform_refresh().await;
            manager.finish_refresh(id);
            result
        });

        let manager = self.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    manager.finish_refresh(id);
                    Err(AuthError::Transport {
                        message: format!("Token refresh task failed: {}", e),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    fn finish_refresh(&self, id: u64) {
        let mut slot = lock(&self.inner.in_flight);
        if slot.as_ref().map(|pending| pending.id) == Some(id) {
            slot.take();
        }
    }

    async fn perform_refresh(&self) -> Result<String> {
        tracing::debug!("Refreshing access token...");

        match self.try_refresh().await {
            Ok(access_token) => Ok(access_token),
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.clear_tokens();
                Err(e)
            }
        }
    }

    async fn try_refresh(&self) -> Result<String> {
        let tokens = self.get_tokens();

        let refresh_token = tokens.refresh_token.clone().ok_or(AuthError::NoRefreshToken)?;

        if tokens.refresh_expired_at(Utc::now()) {
            return Err(AuthError::RefreshTokenExpired);
        }

        let pair =
            refresh::refresh_session(&self.inner.client, &self.inner.base_url, &refresh_token)
                .await?;

        self.set_tokens(&pair)?;
        Ok(pair.access_token)
    }

    /// Get a valid access token, refreshing if necessary
    ///
    /// Returns `None` when logged out or when the refresh fails; the cause
    /// is logged, not returned.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let tokens = self.get_tokens();
        let access_token = tokens.access_token.clone()?;

        if !tokens.access_expired_at(Utc::now(), self.inner.refresh_skew) {
            return Some(access_token);
        }

        match self.refresh_access_token().await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(
                    requires_login = e.requires_login(),
                    "No valid access token after refresh attempt: {}",
                    e
                );
                None
            }
        }
    }

    /// Arm the proactive refresh for the stored access token
    ///
    /// Fires `skew` before expiry, or immediately if that moment has passed.
    /// Replaces any previously armed refresh.
    pub fn schedule_token_refresh(&self) {
        self.cancel_scheduled_refresh();

        let Some(due) = self.get_tokens().refresh_due_at(self.inner.refresh_skew) else {
            return;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No async runtime available, proactive token refresh not scheduled");
                return;
            }
        };

        let now = Utc::now();
        let fires_at = due.max(now);
        let delay = (fires_at - now).to_std().unwrap_or_default();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);

        // Hold the slot while spawning so a zero-delay timer sees itself armed
        let mut slot = lock(&self.inner.timer);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = SessionTokenManager { inner };

            // A fired timer is no longer live
            {
                let mut slot = lock(&manager.inner.timer);
                if slot.as_ref().map(|t| t.id) == Some(id) {
                    slot.take();
                }
            }

            tracing::debug!("Scheduled token refresh firing");
            if let Err(e) = manager.refresh_access_token().await {
                tracing::error!("Scheduled token refresh failed: {}", e);
            }
        });

        if let Some(previous) = slot.replace(ScheduledRefresh {
            id,
            fires_at,
            handle,
        }) {
            previous.handle.abort();
        }

        tracing::debug!("Scheduled token refresh at {}", fires_at.to_rfc3339());
    }

    fn cancel_scheduled_refresh(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.handle.abort();
            tracing::debug!("Cancelled scheduled token refresh");
        }
    }

    /// When the armed proactive refresh will fire, if one is armed
    pub fn scheduled_refresh_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.timer).as_ref().map(|t| t.fires_at)
    }

    /// Start-of-process setup
    ///
    /// Re-arms the proactive refresh for persisted tokens and listens on
    /// `resume_events` for the process coming back to the foreground.
    pub fn initialize<S>(&self, resume_events: S) -> JoinHandle<()>
    where
        S: Stream<Item = ()> + Send + 'static,
    {
        if self.get_tokens().access_token.is_some() {
            self.schedule_token_refresh();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut events = std::pin::pin!(resume_events);
            while events.next().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionTokenManager { inner }.on_resume().await;
            }
            tracing::debug!("Resume listener stopped");
        })
    }

    /// Refresh if the process resumed with an expired access token but a usable refresh token
    pub async fn on_resume(&self) {
        let tokens = self.get_tokens();
        let now = Utc::now();

        if tokens.access_expired_at(now, self.inner.refresh_skew) && !tokens.refresh_expired_at(now)
        {
            tracing::info!("Resumed with an expired access token, refreshing");
            if let Err(e) = self.refresh_access_token().await {
                tracing::error!("Token refresh on resume failed: {}", e);
            }
        }
    }

    /// Log in with username and password and store the issued session
    ///
    /// Returns the user record sent by the server, if any.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        role: Option<UserRole>,
    ) -> Result<Option<serde_json::Value>> {
        let (pair, user) =
            refresh::login(&self.inner.client, &self.inner.base_url, username, password, role)
                .await?;

        self.set_tokens(&pair)?;
        tracing::info!(
            "Logged in, access token expires: {}",
            pair.access_token_expires_at.to_rfc3339()
        );
        Ok(user)
    }
}

// Custom Debug impl that hides sensitive data
impl std::fmt::Debug for SessionTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokenManager")
            .field("base_url", &self.inner.base_url.as_str())
            .field("refresh_skew", &self.inner.refresh_skew)
            .field("tokens", &"[REDACTED]")
            .finish()
    }
}
