//! Browser session state that lets requests through the anti-bot challenge.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
}

impl Cookie {
    /// Parses the `name=value` pair and `Domain` attribute of a
    /// `Set-Cookie` header. `default_domain` is used when none is given.
    pub fn parse_set_cookie(raw: &str, default_domain: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let domain = parts
            .filter_map(|attr| attr.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("domain"))
            .map(|(_, v)| v.trim().trim_start_matches('.').to_string())
            .unwrap_or_else(|| default_domain.to_string());

        Some(Self {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain,
        })
    }
}

/// Cookies plus the user agent they were issued to. Upstream ties clearance
/// cookies to the agent string, so both are replayed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cookies: Vec<Cookie>,
    pub user_agent: String,
    pub acquired_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            cookies: Vec::new(),
            user_agent: user_agent.into(),
            acquired_at: Utc::now(),
        }
    }

    /// Merges every `Set-Cookie` header of a response; later values replace
    /// earlier cookies of the same name.
    pub fn absorb(&mut self, headers: &HeaderMap, default_domain: &str) {
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else { continue };
            if let Some(cookie) = Cookie::parse_set_cookie(raw, default_domain) {
                self.cookies.retain(|c| c.name != cookie.name);
                self.cookies.push(cookie);
            }
        }
    }

    /// Value for a `Cookie` request header, or `None` without cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// JSON file holding the last acquired [`Session`], so a restart does not
/// have to solve the challenge again.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("decoding session from {}", self.path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(session)?;
        fs::write(&self.path, raw).with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}
