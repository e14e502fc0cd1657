use crate::fetch::client::HttpClient;
use crate::fetch::session::Session;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderValue, REFERER, USER_AGENT};
use std::sync::Arc;
use tracing::warn;

/// Shared slot holding the active session; replaced when a challenge is
/// solved again.
pub type SessionSlot = Arc<RwLock<Option<Session>>>;

/// An [`HttpClient`] wrapper that replays the current browser session: its
/// cookies, its user agent and the navigation headers a browser would send.
pub struct SessionCookie<C> {
    pub inner: C,
    pub session: SessionSlot,
    pub default_agent: String,
}

impl<C> SessionCookie<C> {
    pub fn new(inner: C, session: SessionSlot, default_agent: impl Into<String>) -> Self {
        Self {
            inner,
            session,
            default_agent: default_agent.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for SessionCookie<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let (agent, cookies) = match self.session.read().as_ref() {
            Some(s) => (s.user_agent.clone(), s.cookie_header()),
            None => (self.default_agent.clone(), None),
        };

        let headers = req.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("nl-NL,nl;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(REFERER, HeaderValue::from_static("https://www.belgiantrain.be/"));
        match HeaderValue::from_str(&agent) {
            Ok(v) => {
                headers.insert(USER_AGENT, v);
            }
            Err(_) => warn!("Session user agent is not a valid header value"),
        }
        if let Some(cookies) = cookies {
            match HeaderValue::from_str(&cookies) {
                Ok(v) => {
                    headers.insert(COOKIE, v);
                }
                Err(_) => warn!("Session cookies are not a valid header value"),
            }
        }

        self.inner.execute(req).await
    }
}
