//! Runtime settings, read from the environment (after `.env` is loaded).

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fetch::{Endpoints, RetryPolicy};

pub const DEFAULT_REALTIME_URL: &str =
    "https://sncb-opendata.hafas.de/gtfs/realtime/d22ad6759ee25bg84ddb6c818g4dc4de_TC";
pub const DEFAULT_STATIC_URL: &str =
    "https://sncb-opendata.hafas.de/gtfs/static/d22ad6759ee25bg84ddb6c818g4dc4de_TC";
pub const DEFAULT_LANDING_URL: &str =
    "https://www.belgiantrain.be/nl/3rd-party-services/mobility-service-providers/public-data";

#[derive(Debug, Clone)]
pub struct Settings {
    pub realtime_url: String,
    pub static_url: String,
    pub landing_url: String,
    pub data_dir: PathBuf,
    pub cookies_file: PathBuf,
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_max_attempts: u32,
    pub fetch_backoff: Duration,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            static_url: DEFAULT_STATIC_URL.to_string(),
            landing_url: DEFAULT_LANDING_URL.to_string(),
            data_dir: PathBuf::from("data"),
            cookies_file: PathBuf::from("data/cookies.json"),
            fast_interval: Duration::from_secs(30),
            slow_interval: Duration::from_secs(86_400),
            fetch_timeout: Duration::from_secs(30),
            fetch_max_attempts: 4,
            fetch_backoff: Duration::from_millis(500),
            bind_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Settings {
    /// Defaults overridden by whichever variables are set.
    pub fn from_env() -> Result<Self> {
        let mut s = Self::default();

        if let Some(v) = var("REALTIME_URL") {
            s.realtime_url = v;
        }
        if let Some(v) = var("STATIC_URL") {
            s.static_url = v;
        }
        if let Some(v) = var("LANDING_URL") {
            s.landing_url = v;
        }
        if let Some(v) = var("DATA_DIR") {
            s.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("COOKIES_FILE") {
            s.cookies_file = PathBuf::from(v);
        }
        if let Some(secs) = parsed::<u64>("FAST_INTERVAL_SECS")? {
            s.fast_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>("SLOW_INTERVAL_SECS")? {
            s.slow_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>("FETCH_TIMEOUT_SECS")? {
            s.fetch_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed::<u32>("FETCH_MAX_ATTEMPTS")? {
            s.fetch_max_attempts = n.max(1);
        }
        if let Some(ms) = parsed::<u64>("FETCH_BACKOFF_MS")? {
            s.fetch_backoff = Duration::from_millis(ms);
        }
        if let Some(v) = var("BIND_ADDR") {
            s.bind_addr = v;
        }

        Ok(s)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            realtime: self.realtime_url.clone(),
            static_archive: self.static_url.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.fetch_timeout,
            max_attempts: self.fetch_max_attempts,
            backoff: self.fetch_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a number, got '{v}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.fast_interval, Duration::from_secs(30));
        assert_eq!(s.slow_interval, Duration::from_secs(86_400));
        assert_eq!(s.cookies_file, PathBuf::from("data/cookies.json"));
        assert_eq!(s.endpoints().realtime, DEFAULT_REALTIME_URL);

        let policy = s.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
    }
}
