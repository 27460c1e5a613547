//! Client configuration.
//!
//! Values come from serialized defaults merged with `TIMETRACK_`-prefixed
//! environment variables (`TIMETRACK_ORIGIN`, `TIMETRACK_BASE_PATH`,
//! `TIMETRACK_TIMEOUT_SECS`, `TIMETRACK_USER_AGENT`).

use std::time::Duration;

use figment::providers::{Env, Format as _, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "TIMETRACK_";

fn default_origin() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_base_path() -> String {
    "/api/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Scheme, host and port of the API server.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Prefix joined in front of every request path (defaults to `/api/v1`).
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Transport timeout per request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            base_path: default_base_path(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

impl ClientConfig {
    /// Defaults with a different origin. A trailing slash is stripped.
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Loads configuration from the environment, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if a variable has the wrong type.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
    }

    /// Parses configuration from a JSON string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the JSON is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::string(json))
            .extract()
    }

    /// Absolute URL for an API path such as `/projects`.
    pub fn url(&self, path: &str) -> String {
        let origin = self.origin.trim_end_matches('/');
        let base = self.base_path.trim_matches('/');
        let path = path.trim_start_matches('/');
        if base.is_empty() {
            format!("{origin}/{path}")
        } else {
            format!("{origin}/{base}/{path}")
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
