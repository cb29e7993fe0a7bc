//! Environment driven configuration.
//!
//! Every key is optional; `Config::default()` is what an empty environment
//! produces. A `.env` file is honoured when the binary loads it first.

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Temporary artifacts and their session records.
    pub temp_dir: PathBuf,
    /// Permanent storage namespace.
    pub upload_dir: PathBuf,
    /// Inactivity after which an unfinished session is reclaimed.
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// How long finalized sessions stay queryable before being pruned.
    pub finalized_grace: Duration,
    /// Advertised as `Tus-Max-Size`; `None` means unlimited.
    pub max_size: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./data/tmp"),
            upload_dir: PathBuf::from("./data/uploads"),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            finalized_grace: Duration::from_secs(60),
            max_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Path the tus endpoints are mounted under.
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            base_path: "/files/tus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let engine = EngineConfig {
            temp_dir: lookup("TUS_TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.engine.temp_dir),
            upload_dir: lookup("TUS_UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.engine.upload_dir),
            session_ttl: parse(&lookup, "TUS_SESSION_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.engine.session_ttl),
            sweep_interval: parse(&lookup, "TUS_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.engine.sweep_interval),
            finalized_grace: parse(&lookup, "TUS_FINALIZED_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.engine.finalized_grace),
            max_size: parse(&lookup, "TUS_MAX_SIZE")?,
        };

        let base_path = lookup("TUS_BASE_PATH").unwrap_or(defaults.server.base_path);
        let server = ServerConfig {
            bind_addr: parse(&lookup, "TUS_BIND_ADDR")?.unwrap_or(defaults.server.bind_addr),
            base_path: format!("/{}", base_path.trim_matches('/')),
        };

        if engine.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "TUS_SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self { engine, server })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.engine.session_ttl, Duration::from_secs(86400));
        assert_eq!(config.engine.max_size, None);
        assert_eq!(config.server.base_path, "/files/tus");
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("TUS_SESSION_TTL_SECS", "30"),
            ("TUS_MAX_SIZE", "1048576"),
            ("TUS_BIND_ADDR", "127.0.0.1:9000"),
            ("TUS_BASE_PATH", "uploads/"),
        ]))
        .unwrap();

        assert_eq!(config.engine.session_ttl, Duration::from_secs(30));
        assert_eq!(config.engine.max_size, Some(1048576));
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.server.base_path, "/uploads");
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let result = Config::from_lookup(lookup(&[("TUS_SESSION_TTL_SECS", "soon")]));

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "TUS_SESSION_TTL_SECS",
                ..
            })
        ));
    }
}
