use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{ETAG, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Method, Request, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::auth::{SessionCookie, SessionSlot};
use super::bypass::{Bypass, USER_AGENTS};
use super::client::HttpClient;
use super::session::SessionStore;
use crate::error::FetchError;

/// The two upstream resources being mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// GTFS-RT protobuf feed.
    Realtime,
    /// Zip archive of GTFS static files.
    Static,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Realtime => "realtime",
            Resource::Static => "static",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can produce the raw bytes of a resource.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn fetch(&self, resource: Resource) -> Result<Bytes, FetchError>;

    /// The payload last returned for `resource` was fully published. Only
    /// confirmed payloads may be answered with [`FetchError::NotModified`].
    fn confirm(&self, _resource: Resource) {}
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub realtime: String,
    pub static_archive: String,
}

impl Endpoints {
    pub fn url(&self, resource: Resource) -> &str {
        match resource {
            Resource::Realtime => &self.realtime,
            Resource::Static => &self.static_archive,
        }
    }
}

/// Retry behaviour of a [`Fetcher`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Upper bound on one attempt, response body included.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: doubling from `backoff`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 4,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Validators {
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
}

/// Fetches upstream resources through the anti-bot challenge.
///
/// Every attempt is bounded by [`RetryPolicy::timeout`]. A challenge
/// response triggers one session refresh through the [`Bypass`] before the
/// next attempt; if the refresh itself fails the fetch ends with
/// [`FetchError::Blocked`]. Conditional request headers are sent once a
/// resource has been fetched and confirmed, and a `304` is reported as
/// [`FetchError::NotModified`]. Validators of an unconfirmed payload stay
/// pending, so a payload that failed downstream is fetched in full again.
pub struct Fetcher<C, B> {
    client: SessionCookie<C>,
    bypass: B,
    session: SessionSlot,
    sessions: Option<SessionStore>,
    endpoints: Endpoints,
    policy: RetryPolicy,
    validators: Mutex<HashMap<Resource, Validators>>,
    pending: Mutex<HashMap<Resource, Validators>>,
    refresh: tokio::sync::Mutex<()>,
}

impl<C: HttpClient, B: Bypass> Fetcher<C, B> {
    pub fn new(client: C, bypass: B, endpoints: Endpoints, policy: RetryPolicy) -> Self {
        let session = SessionSlot::default();
        Self {
            client: SessionCookie::new(client, session.clone(), USER_AGENTS[0]),
            bypass,
            session,
            sessions: None,
            endpoints,
            policy,
            validators: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Persists sessions to `store`, seeding the current one from it.
    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        match store.load() {
            Ok(Some(session)) => {
                info!(
                    path = %store.path().display(),
                    cookies = session.cookies.len(),
                    "Loaded stored session"
                );
                *self.session.write() = Some(session);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable session file"),
        }
        self.sessions = Some(store);
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn attempt(&self, resource: Resource) -> Result<Bytes, FetchError> {
        let url = self
            .endpoints
            .url(resource)
            .parse::<reqwest::Url>()
            .map_err(|e| FetchError::Network(format!("invalid url for {resource}: {e}")))?;
        let mut req = Request::new(Method::GET, url);
        let validators = self.validators.lock().get(&resource).cloned();
        if let Some(v) = validators {
            if let Some(etag) = &v.etag {
                req.headers_mut().insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(lm) = &v.last_modified {
                req.headers_mut().insert(IF_MODIFIED_SINCE, lm.clone());
            }
        }

        let resp = self
            .client
            .execute(req)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return Err(FetchError::NotModified);
        }

        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if self.bypass.is_blocked(status, &headers, &body) {
            return Err(FetchError::Blocked(format!("challenge served (HTTP {status})")));
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!("unexpected HTTP {status}")));
        }

        let validators = Validators {
            etag: headers.get(ETAG).cloned(),
            last_modified: headers.get(LAST_MODIFIED).cloned(),
        };
        self.pending.lock().insert(resource, validators);
        Ok(body)
    }

    /// Replaces the session unless another task already did so while this
    /// one waited.
    async fn refresh_session(&self) -> Result<(), FetchError> {
        let seen = self.session.read().as_ref().map(|s| s.acquired_at);
        let _guard = self.refresh.lock().await;
        let current = self.session.read().clone();
        if current.as_ref().map(|s| s.acquired_at) != seen {
            debug!("Session already refreshed by another fetch");
            return Ok(());
        }

        let fresh = self.bypass.acquire_session(current.as_ref()).await?;
        if let Some(store) = &self.sessions {
            if let Err(e) = store.save(&fresh) {
                warn!(error = %e, "Failed to persist session");
            }
        }
        *self.session.write() = Some(fresh);
        Ok(())
    }
}

#[async_trait]
impl<C: HttpClient, B: Bypass> ResourceSource for Fetcher<C, B> {
    #[instrument(skip_all, fields(resource = %resource))]
    async fn fetch(&self, resource: Resource) -> Result<Bytes, FetchError> {
        let mut last = FetchError::Network("no attempt made".into());
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay(attempt - 1)).await;
            }

            let outcome = tokio::time::timeout(self.policy.timeout, self.attempt(resource))
                .await
                .unwrap_or_else(|_| {
                    Err(FetchError::Network(format!(
                        "timed out after {:?}",
                        self.policy.timeout
                    )))
                });

            match outcome {
                Ok(bytes) => {
                    debug!(attempt, bytes = bytes.len(), "Fetched");
                    return Ok(bytes);
                }
                Err(FetchError::NotModified) => return Err(FetchError::NotModified),
                Err(FetchError::Blocked(reason)) => {
                    if attempt < attempts {
                        warn!(attempt, %reason, "Blocked by upstream, refreshing session");
                        self.refresh_session().await?;
                    } else {
                        warn!(attempt, %reason, "Blocked by upstream on final attempt");
                    }
                    last = FetchError::Blocked(reason);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Fetch attempt failed");
                    last = e;
                }
            }
        }

        Err(last)
    }

    fn confirm(&self, resource: Resource) {
        let Some(validators) = self.pending.lock().remove(&resource) else {
            return;
        };
        debug!(%resource, "Conditional validators confirmed");
        self.validators.lock().insert(resource, validators);
    }
}
