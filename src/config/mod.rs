use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:1883";
/// 1 MiB. The decoder allocates the full claimed body up front.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1_048_576;
pub const DEFAULT_SEND_QUEUE_LENGTH: usize = 20;
pub const DEFAULT_TAKEOVER_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Largest accepted remaining length, in bytes.
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound queue capacity per session.
    pub send_queue_length: usize,
    pub takeover_timeout_ms: u64,
    /// Log every packet in and out at debug level.
    pub dump: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_length: DEFAULT_SEND_QUEUE_LENGTH,
            takeover_timeout_ms: DEFAULT_TAKEOVER_TIMEOUT_MS,
            dump: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// 0 picks the number of available CPUs.
    pub shard_count: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub router: RouterConfig,
    pub stats: StatsConfig,
}

/// Parses a TOML file. Missing sections and fields fall back to defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

impl Config {
    /// Loads from `path`, or `BLIPMQTT_CONFIG` when no path is given, then
    /// applies environment overrides.
    ///
    /// With neither a path nor `BLIPMQTT_CONFIG`, starts from defaults. A path
    /// that was named but cannot be read is an error.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = path
            .map(str::to_string)
            .or_else(|| env::var("BLIPMQTT_CONFIG").ok());

        let mut config = match effective_path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `BLIPMQTT_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BLIPMQTT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("BLIPMQTT_STATS_INTERVAL_SECS") {
            self.stats.interval_secs = parse_var("BLIPMQTT_STATS_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("BLIPMQTT_SEND_QUEUE_LENGTH") {
            self.session.send_queue_length = parse_var("BLIPMQTT_SEND_QUEUE_LENGTH", &v)?;
        }
        if let Some(v) = lookup("BLIPMQTT_SHARD_COUNT") {
            self.router.shard_count = parse_var("BLIPMQTT_SHARD_COUNT", &v)?;
        }
        Ok(())
    }

    pub fn takeover_timeout(&self) -> Duration {
        Duration::from_millis(self.session.takeover_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats.interval_secs.max(1))
    }

    pub fn resolved_shard_count(&self) -> usize {
        match self.router.shard_count {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind_addr, "0.0.0.0:1883");
        assert_eq!(config.server.max_packet_size, 1_048_576);
        assert_eq!(config.session.send_queue_length, 20);
        assert_eq!(config.takeover_timeout(), Duration::from_secs(1));
        assert_eq!(config.stats_interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [session]
            send_queue_length = 64

            [router]
            shard_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.session.send_queue_length, 64);
        assert_eq!(config.session.takeover_timeout_ms, 1_000);
        assert_eq!(config.resolved_shard_count(), 3);
        assert_eq!(config.stats.interval_secs, 10);
    }

    #[test]
    fn zero_shards_resolves_to_cpu_count() {
        assert!(Config::default().resolved_shard_count() >= 1);
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("BLIPMQTT_BIND_ADDR", "127.0.0.1:2883"),
            ("BLIPMQTT_STATS_INTERVAL_SECS", "5"),
            ("BLIPMQTT_SEND_QUEUE_LENGTH", " 100 "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:2883");
        assert_eq!(config.stats.interval_secs, 5);
        assert_eq!(config.session.send_queue_length, 100);
        assert_eq!(config.router.shard_count, 0);
    }

    #[test]
    fn bad_override_is_a_parse_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "BLIPMQTT_SHARD_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(msg) if msg.starts_with("BLIPMQTT_SHARD_COUNT")));
    }
}
