//! Runtime configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collector::RetryPolicy;

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Data directory used inside the container image, preferred when present.
pub const CONTAINER_DATA_DIR: &str = "/app/data";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7860;

/// Default base URL of the relationship API.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

/// Default prefix for profile links in exports.
pub const DEFAULT_PROFILE_URL_BASE: &str = "https://instagram.com/";

/// Default bound on the initial profile lookup.
pub const DEFAULT_PROFILE_TIMEOUT_SECS: u64 = 300;

/// Default interval between "still waiting" notices during the profile lookup.
pub const DEFAULT_PROFILE_NOTICE_SECS: u64 = 10;

/// Default pause between login and the first profile request.
pub const DEFAULT_SETTLE_SECS: u64 = 10;

/// Default request timeout for the HTTP client.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u32 = crate::api::DEFAULT_PAGE_SIZE;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where sessions and result sets live.
    pub data_dir: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Base URL of the relationship API.
    pub api_base: String,
    /// Prefix for the `profile_url` export column.
    pub profile_url_base: String,
    /// Bound on the initial profile lookup.
    pub profile_timeout: Duration,
    /// Interval between "still waiting" notices during the profile lookup.
    pub profile_notice_interval: Duration,
    /// Pause between login and the first profile request.
    pub settle_delay: Duration,
    /// Request timeout for the HTTP client.
    pub http_timeout: Duration,
    /// Accounts requested per page.
    pub page_size: u32,
    /// Keep latest copies of the derived lists at the data-dir root.
    pub legacy_exports: bool,
    /// Collector tuning.
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            port: DEFAULT_PORT,
            api_base: DEFAULT_API_BASE.to_string(),
            profile_url_base: DEFAULT_PROFILE_URL_BASE.to_string(),
            profile_timeout: Duration::from_secs(DEFAULT_PROFILE_TIMEOUT_SECS),
            profile_notice_interval: Duration::from_secs(DEFAULT_PROFILE_NOTICE_SECS),
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            page_size: DEFAULT_PAGE_SIZE,
            legacy_exports: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `RECIPROCITY_DATA_DIR`: data directory (default: `/app/data` if it exists, else `./data`)
    /// - `RECIPROCITY_PORT`: HTTP port (default: 7860)
    /// - `RECIPROCITY_API_BASE`: relationship API base URL
    /// - `RECIPROCITY_PROFILE_URL_BASE`: profile link prefix (default: `https://instagram.com/`)
    /// - `RECIPROCITY_PROFILE_TIMEOUT_SECS`: profile lookup bound (default: 300)
    /// - `RECIPROCITY_SETTLE_SECS`: pause after login (default: 10)
    /// - `RECIPROCITY_HTTP_TIMEOUT_SECS`: per-request timeout (default: 30)
    /// - `RECIPROCITY_PAGE_SIZE`: accounts per page (default: 50)
    /// - `RECIPROCITY_LEGACY_EXPORTS`: keep latest copies at the root (default: true)
    /// - `RECIPROCITY_CONNECT_MAX_RETRIES`: give up after this many connection errors (default: never)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = env::var("RECIPROCITY_DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map_or_else(default_data_dir, PathBuf::from);

        let mut retry = defaults.retry;
        retry.connectivity_max_retries = parse_var("RECIPROCITY_CONNECT_MAX_RETRIES");

        Self {
            data_dir,
            port: parse_var("RECIPROCITY_PORT").unwrap_or(defaults.port),
            api_base: env::var("RECIPROCITY_API_BASE").unwrap_or(defaults.api_base),
            profile_url_base: env::var("RECIPROCITY_PROFILE_URL_BASE")
                .unwrap_or(defaults.profile_url_base),
            profile_timeout: parse_var("RECIPROCITY_PROFILE_TIMEOUT_SECS")
                .map_or(defaults.profile_timeout, Duration::from_secs),
            profile_notice_interval: defaults.profile_notice_interval,
            settle_delay: parse_var("RECIPROCITY_SETTLE_SECS")
                .map_or(defaults.settle_delay, Duration::from_secs),
            http_timeout: parse_var("RECIPROCITY_HTTP_TIMEOUT_SECS")
                .map_or(defaults.http_timeout, Duration::from_secs),
            page_size: parse_var("RECIPROCITY_PAGE_SIZE").unwrap_or(defaults.page_size),
            legacy_exports: env::var("RECIPROCITY_LEGACY_EXPORTS")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.legacy_exports),
            retry,
        }
    }

    /// Defaults with a specific data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    let container = Path::new(CONTAINER_DATA_DIR);
    if container.is_dir() {
        container.to_path_buf()
    } else {
        PathBuf::from(DEFAULT_DATA_DIR)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
