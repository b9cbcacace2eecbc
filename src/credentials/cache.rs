use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, doc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::error::CredentialError;

/// Lead time before expiry at which a cached credential is treated as stale.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(6);

/// When a fetched credential stops being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    At(Instant),
    /// Static credentials, e.g. taken from the environment.
    Never,
}

/// Credential material handed to the engine.
#[derive(Clone)]
pub enum Credential {
    Aws {
        access_key_id: String,
        secret_access_key: Zeroizing<String>,
        session_token: Option<Zeroizing<String>>,
    },
    /// OAuth bearer token (Azure, GCP).
    AccessToken(Zeroizing<String>),
}

impl Credential {
    /// Provider settings document in the shape the engine expects.
    pub fn to_document(&self) -> Document {
        match self {
            Credential::Aws {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let mut settings = doc! {
                    "accessKeyId": access_key_id.as_str(),
                    "secretAccessKey": secret_access_key.as_str(),
                };
                if let Some(token) = session_token {
                    settings.insert("sessionToken", token.as_str());
                }
                settings
            }
            Credential::AccessToken(token) => doc! { "accessToken": token.as_str() },
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Aws {
                access_key_id,
                session_token,
                ..
            } => f
                .debug_struct("Aws")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"***")
                .field("session_token", &session_token.as_ref().map(|_| "***"))
                .finish(),
            Credential::AccessToken(_) => f.write_str("AccessToken(***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub credential: Credential,
    pub expiry: Expiry,
}

impl CachedToken {
    pub fn new(credential: Credential, expiry: Expiry) -> Self {
        Self { credential, expiry }
    }

    /// Token valid for `lifetime` from now.
    pub fn expiring_in(credential: Credential, lifetime: Duration) -> Self {
        Self::new(credential, Expiry::At(Instant::now() + lifetime))
    }
}

/// True iff `now >= expires_at - margin`.
pub fn needs_refresh(token: &CachedToken, now: Instant, margin: Duration) -> bool {
    match token.expiry {
        Expiry::Never => false,
        Expiry::At(expires_at) => now
            .checked_add(margin)
            .is_none_or(|refresh_at| refresh_at >= expires_at),
    }
}

/// Provider endpoint (or SDK-equivalent) that hands out fresh credentials.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Provider type this source serves: `aws`, `azure` or `gcp`.
    fn provider(&self) -> &'static str;

    async fn fetch(&self) -> Result<CachedToken, CredentialError>;
}

type PendingFetch = Shared<BoxFuture<'static, Result<CachedToken, CredentialError>>>;

enum Slot {
    Empty,
    Cached(CachedToken),
    /// A fetch is running; callers attach to it instead of starting their own.
    Fetching(PendingFetch),
}

struct Inner {
    slot: Slot,
    /// Bumped by `reset_cache` so a fetch started before the reset does not
    /// store its result afterwards.
    generation: u64,
}

/// In-memory, single-flight credential cache for one provider.
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_margin(source, REFRESH_MARGIN)
    }

    pub fn with_margin(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            margin,
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Empty,
                generation: 0,
            })),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.source.provider()
    }

    /// Return the cached credential, fetching a new one when the slot is
    /// empty or stale. Callers arriving during a fetch share its outcome.
    pub async fn get_token(&self) -> Result<CachedToken, CredentialError> {
        let pending = {
            let mut inner = lock(&self.inner);
            let reusable = match &inner.slot {
                Slot::Cached(token) if !needs_refresh(token, Instant::now(), self.margin) => {
                    return Ok(token.clone());
                }
                Slot::Fetching(pending) => Some(pending.clone()),
                Slot::Empty | Slot::Cached(_) => None,
            };
            match reusable {
                Some(pending) => pending,
                None => {
                    tracing::debug!(provider = self.provider(), "fetching fresh credentials");
                    let pending = self.start_fetch(inner.generation);
                    inner.slot = Slot::Fetching(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    pub fn needs_refresh(&self, token: &CachedToken) -> bool {
        needs_refresh(token, Instant::now(), self.margin)
    }

    /// Drop whatever is cached. A fetch already in flight still completes for
    /// its waiters but is not stored.
    pub fn reset_cache(&self) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        inner.slot = Slot::Empty;
    }

    fn start_fetch(&self, generation: u64) -> PendingFetch {
        let source = self.source.clone();
        let inner = self.inner.clone();
        async move {
            let result = source.fetch().await;
            let mut inner = lock(&inner);
            if inner.generation == generation {
                inner.slot = match &result {
                    Ok(token) => Slot::Cached(token.clone()),
                    Err(err) => {
                        tracing::debug!(provider = source.provider(), error = %err, "credential fetch failed");
                        Slot::Empty
                    }
                };
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("provider", &self.provider())
            .field("margin", &self.margin)
            .finish()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
