use anyhow::{Context, Result};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3005;

/// Tolerances and timeouts of the synchronization engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deviation (ms) a client tolerates before seeking to a commanded position
    pub close_enough_ms: i64,
    /// How long a client may take to parse newly loaded media
    pub handshake_timeout: Duration,
    /// How long a client may take to acknowledge ServerReady
    pub ready_timeout: Duration,
    /// Steady-state status queries
    pub command_timeout: Duration,
    /// Protocol violations tolerated before a client is disconnected
    pub max_violations: u32,
    /// Bounds of the jittered position tick
    pub tick_min: Duration,
    pub tick_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            close_enough_ms: 1500,
            handshake_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            max_violations: 3,
            tick_min: Duration::from_millis(75),
            tick_max: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Media loaded right after startup
    pub media: Option<PathBuf>,
    pub ffprobe: String,
    /// Skip probing and assume this duration (ms)
    pub fixed_duration: Option<i64>,
    pub sync: SyncConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_var(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);
        let bind = parse_var(&lookup, "TANDEM_BIND")?.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let defaults = SyncConfig::default();
        let millis = |key: &str, fallback: Duration| -> Result<Duration> {
            Ok(parse_var::<u64, _>(&lookup, key)?
                .map(Duration::from_millis)
                .unwrap_or(fallback))
        };

        let sync = SyncConfig {
            close_enough_ms: parse_var(&lookup, "TANDEM_CLOSE_ENOUGH_MS")?
                .unwrap_or(defaults.close_enough_ms),
            handshake_timeout: millis("TANDEM_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout)?,
            ready_timeout: millis("TANDEM_READY_TIMEOUT_MS", defaults.ready_timeout)?,
            command_timeout: millis("TANDEM_COMMAND_TIMEOUT_MS", defaults.command_timeout)?,
            max_violations: parse_var(&lookup, "TANDEM_MAX_VIOLATIONS")?
                .unwrap_or(defaults.max_violations),
            ..defaults
        };

        Ok(Self {
            addr: SocketAddr::new(bind, port),
            media: lookup("TANDEM_MEDIA").filter(|v| !v.is_empty()).map(PathBuf::from),
            ffprobe: lookup("TANDEM_FFPROBE").unwrap_or_else(|| "ffprobe".to_string()),
            fixed_duration: parse_var(&lookup, "TANDEM_DURATION_MS")?,
            sync,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: {value:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr.port(), 3005);
        assert_eq!(cfg.sync.close_enough_ms, 1500);
        assert_eq!(cfg.sync.handshake_timeout, Duration::from_secs(60));
        assert_eq!(cfg.sync.command_timeout, Duration::from_secs(1));
        assert!(cfg.media.is_none());
        assert_eq!(cfg.ffprobe, "ffprobe");
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("PORT", "8080"),
            ("TANDEM_BIND", "127.0.0.1"),
            ("TANDEM_MEDIA", "/tmp/movie.mkv"),
            ("TANDEM_CLOSE_ENOUGH_MS", "750"),
            ("TANDEM_HANDSHAKE_TIMEOUT_MS", "2000"),
            ("TANDEM_DURATION_MS", "90000"),
        ])
        .unwrap();
        assert_eq!(cfg.addr.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.media, Some(PathBuf::from("/tmp/movie.mkv")));
        assert_eq!(cfg.sync.close_enough_ms, 750);
        assert_eq!(cfg.sync.handshake_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.fixed_duration, Some(90_000));
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let err = config(&[("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
