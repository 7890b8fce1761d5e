//! Client configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable holding the control-plane API key.
pub const ENV_API_KEY: &str = "SANDBOX_API_KEY";
/// Environment variable overriding the control-plane URL.
pub const ENV_API_URL: &str = "SANDBOX_API_URL";

const DEFAULT_API_URL: &str = "https://api.sandboxd.dev";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SDK configuration: control-plane credentials and default deadlines.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_url: String,
    /// Default per-call deadline on the data plane.
    pub request_timeout: Duration,
    /// Deadline for dialing and handshaking the daemon connection.
    pub connect_timeout: Duration,
}

impl Config {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Build from `SANDBOX_API_KEY` and (optionally) `SANDBOX_API_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| Error::Authentication(format!("{ENV_API_KEY} is not set")))?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var(ENV_API_URL) {
            config.api_url = url;
        }
        Ok(config)
    }

    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}
