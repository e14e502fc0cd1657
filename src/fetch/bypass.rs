//! Detection of, and recovery from, the upstream anti-bot challenge.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, SERVER, USER_AGENT};
use reqwest::{Method, Request, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use super::client::HttpClient;
use super::session::Session;
use crate::error::FetchError;

/// Browser user agents offered in turn when a new session is requested.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (Linux; Android 14; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Mobile Safari/537.36",
];

// Only the head of a challenge page is inspected.
const SNIFF_LEN: usize = 4096;

/// The challenge-handling collaborator of the fetcher.
#[async_trait]
pub trait Bypass: Send + Sync {
    /// Whether a response is the challenge page rather than the resource.
    fn is_blocked(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool;

    /// Obtains a session that upstream will accept. Any failure is reported
    /// as [`FetchError::Blocked`].
    async fn acquire_session(&self, previous: Option<&Session>) -> Result<Session, FetchError>;
}

/// Recognises a Cloudflare-style interstitial: a rejecting status together
/// with the provider's marker header, server banner or page text.
pub fn looks_like_challenge(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool {
    if headers.contains_key("cf-mitigated") {
        return true;
    }
    if !matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    ) {
        return false;
    }

    let server = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if server.contains("cloudflare") {
        return true;
    }

    let head = String::from_utf8_lossy(&body[..body.len().min(SNIFF_LEN)]).to_ascii_lowercase();
    ["cloudflare", "just a moment", "cf-chl", "challenge-platform"]
        .iter()
        .any(|marker| head.contains(marker))
}

/// Re-establishes a session by visiting the public landing page with the
/// next browser identity, keeping whatever clearance cookies it hands out.
pub struct ChallengeBypass<C> {
    client: C,
    landing_url: String,
    timeout: Duration,
    next_agent: AtomicUsize,
}

impl<C> ChallengeBypass<C> {
    pub fn new(client: C, landing_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            landing_url: landing_url.into(),
            timeout,
            next_agent: AtomicUsize::new(0),
        }
    }

    fn rotate_agent(&self) -> &'static str {
        let i = self.next_agent.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

#[async_trait]
impl<C: HttpClient> Bypass for ChallengeBypass<C> {
    fn is_blocked(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool {
        looks_like_challenge(status, headers, body)
    }

    async fn acquire_session(&self, previous: Option<&Session>) -> Result<Session, FetchError> {
        let url: reqwest::Url = self
            .landing_url
            .parse()
            .map_err(|e| FetchError::Blocked(format!("invalid landing url: {e}")))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let agent = self.rotate_agent();

        let mut req = Request::new(Method::GET, url);
        req.headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(agent));

        let visit = async {
            let resp = self.client.execute(req).await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };
        let (status, headers, body) = tokio::time::timeout(self.timeout, visit)
            .await
            .map_err(|_| FetchError::Blocked("landing page timed out".into()))?
            .map_err(|e| FetchError::Blocked(format!("landing page unreachable: {e}")))?;

        if self.is_blocked(status, &headers, &body) {
            warn!(%status, agent, "Landing page still serves the challenge");
            return Err(FetchError::Blocked(format!("challenge persisted (HTTP {status})")));
        }
        if !status.is_success() {
            return Err(FetchError::Blocked(format!("landing page returned HTTP {status}")));
        }

        let mut session = Session::new(agent);
        // Cookies issued earlier stay valid unless the landing page replaces them.
        if let Some(prev) = previous {
            session.cookies = prev.cookies.clone();
        }
        session.absorb(&headers, &host);
        info!(agent, cookies = session.cookies.len(), "Acquired upstream session");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reqwest::header::SET_COOKIE;

    struct Landing {
        status: u16,
        set_cookie: Option<&'static str>,
        body: &'static str,
        agents: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for Landing {
        async fn execute(&self, req: Request) -> reqwest::Result<reqwest::Response> {
            let agent = req.headers()[USER_AGENT].to_str().unwrap().to_string();
            self.agents.lock().push(agent);
            let mut builder = http::Response::builder().status(self.status);
            if let Some(c) = self.set_cookie {
                builder = builder.header(SET_COOKIE, c);
            }
            Ok(builder.body(self.body).unwrap().into())
        }
    }

    fn landing(status: u16, set_cookie: Option<&'static str>, body: &'static str) -> ChallengeBypass<Landing> {
        ChallengeBypass::new(
            Landing {
                status,
                set_cookie,
                body,
                agents: Mutex::new(Vec::new()),
            },
            "https://www.belgiantrain.be/nl/3rd-party-services/mobility-service-providers/public-data",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_challenge_detection() {
        let mut headers = HeaderMap::new();
        assert!(!looks_like_challenge(StatusCode::OK, &headers, b"PK\x03\x04"));
        assert!(!looks_like_challenge(StatusCode::FORBIDDEN, &headers, b"denied"));
        assert!(looks_like_challenge(
            StatusCode::FORBIDDEN,
            &headers,
            b"<html><title>Just a moment...</title>"
        ));
        assert!(!looks_like_challenge(StatusCode::NOT_FOUND, &headers, b"cloudflare"));

        headers.insert(SERVER, HeaderValue::from_static("cloudflare"));
        assert!(looks_like_challenge(StatusCode::SERVICE_UNAVAILABLE, &headers, b""));

        let mut headers = HeaderMap::new();
        headers.insert("cf-mitigated", HeaderValue::from_static("challenge"));
        assert!(looks_like_challenge(StatusCode::OK, &headers, b""));
    }

    #[tokio::test]
    async fn test_acquire_session_keeps_cookies_and_rotates_agent() {
        let bypass = landing(200, Some("cf_clearance=xyz; Path=/"), "<html>ok</html>");

        let first = bypass.acquire_session(None).await.unwrap();
        assert_eq!(first.cookie_header().as_deref(), Some("cf_clearance=xyz"));
        assert_eq!(first.cookies[0].domain, "www.belgiantrain.be");

        let second = bypass.acquire_session(Some(&first)).await.unwrap();
        assert_ne!(first.user_agent, second.user_agent);
        assert_eq!(bypass.client.agents.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_session_fails_when_still_challenged() {
        let bypass = landing(403, None, "<title>Just a moment...</title> cloudflare");
        let err = bypass.acquire_session(None).await.unwrap_err();
        assert_eq!(err.kind(), "blocked");
    }
}
