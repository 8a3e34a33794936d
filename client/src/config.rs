use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";
const DEFAULT_DRIFT_CHECK_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// `None` disables the drift monitor
    pub drift_check: Option<Duration>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url = lookup("TANDEM_SERVER")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| LOCAL_WS_URL.to_string());

        let drift_ms = match lookup("TANDEM_DRIFT_CHECK_MS").filter(|v| !v.trim().is_empty()) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid value for TANDEM_DRIFT_CHECK_MS: {value:?}"))?,
            None => DEFAULT_DRIFT_CHECK_MS,
        };

        Ok(Self {
            server_url,
            drift_check: (drift_ms > 0).then(|| Duration::from_millis(drift_ms)),
        })
    }
}
