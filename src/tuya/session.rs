use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AuthError;

/// Refresh this long before a known expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// A token handed out by the vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    /// Lifetime in seconds, when the API reports one.
    pub expire_time: Option<i64>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    /// `None` → valid until explicitly invalidated.
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at > now + Duration::seconds(EXPIRY_MARGIN_SECS),
            None => true,
        }
    }
}

/// Process-local access-token state.
///
/// The lock is held across the token exchange so concurrent callers wait
/// for one refresh instead of each starting their own.
#[derive(Debug, Default)]
pub struct TokenSession {
    token: Mutex<Option<CachedToken>>,
}

impl TokenSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the held token, running `exchange` first when there is none,
    /// it is about to expire, or it was invalidated.
    pub async fn ensure_token<F, Fut>(&self, exchange: F) -> Result<String, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IssuedToken, AuthError>>,
    {
        let mut guard = self.token.lock().await;
        let now = Utc::now();

        if let Some(cached) = guard.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(cached.access_token.clone());
        }

        let issued = exchange().await?;
        let expires_at = issued.expire_time.map(|secs| now + Duration::seconds(secs));
        info!(expires_at = ?expires_at, "Obtained new Tuya access token");

        *guard = Some(CachedToken {
            access_token: issued.access_token.clone(),
            expires_at,
        });
        Ok(issued.access_token)
    }

    /// Drops the held token so the next [`ensure_token`](Self::ensure_token)
    /// performs a fresh exchange.
    pub async fn invalidate(&self) {
        if self.token.lock().await.take().is_some() {
            info!("Tuya access token invalidated");
        }
    }
}
