//! Pool configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle time after which a pooled reader is closed by the sweep.
    pub inactive_reader_ttl: Duration,
    /// Idle time after which a pooled writer is closed by the sweep.
    pub inactive_writer_ttl: Duration,
    /// Maximum number of reader segments per table.
    pub reader_pool_max_segments: u32,
    /// Directory holding `<table>.lock` files. `None` disables the cross-process lock.
    pub lock_dir: Option<PathBuf>,
    /// Period of the idle reaper task.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inactive_reader_ttl: Duration::from_secs(120),
            inactive_writer_ttl: Duration::from_secs(600),
            reader_pool_max_segments: 5,
            lock_dir: None,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `TABLEPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "TABLEPOOL_READER_TTL_SECS") {
            config.inactive_reader_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TABLEPOOL_WRITER_TTL_SECS") {
            config.inactive_writer_ttl = Duration::from_secs(secs);
        }
        if let Some(segments) = parse_var::<u32>(&lookup, "TABLEPOOL_READER_SEGMENTS") {
            config.reader_pool_max_segments = segments;
        }
        if let Some(dir) = lookup("TABLEPOOL_LOCK_DIR").filter(|d| !d.is_empty()) {
            config.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(millis) = parse_var::<u64>(&lookup, "TABLEPOOL_SWEEP_INTERVAL_MS") {
            config.sweep_interval = Duration::from_millis(millis);
        }

        config
    }

    pub(crate) fn max_segments(&self) -> u32 {
        self.reader_pool_max_segments.max(1)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable pool setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_engine_settings() {
        let config = PoolConfig::default();
        assert_eq!(config.inactive_reader_ttl, Duration::from_secs(120));
        assert_eq!(config.inactive_writer_ttl, Duration::from_secs(600));
        assert_eq!(config.reader_pool_max_segments, 5);
        assert!(config.lock_dir.is_none());
    }

    #[test]
    fn deserializes_partial_document() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"reader_pool_max_segments": 2, "lock_dir": "/var/lib/db"}"#,
        )
        .unwrap();
        assert_eq!(config.reader_pool_max_segments, 2);
        assert_eq!(config.lock_dir, Some(PathBuf::from("/var/lib/db")));
        assert_eq!(config.inactive_reader_ttl, Duration::from_secs(120));
    }

    #[test]
    fn lookup_overrides_and_skips_garbage() {
        let vars: HashMap<&str, &str> = [
            ("TABLEPOOL_READER_TTL_SECS", "5"),
            ("TABLEPOOL_WRITER_TTL_SECS", "not-a-number"),
            ("TABLEPOOL_READER_SEGMENTS", " 3 "),
            ("TABLEPOOL_SWEEP_INTERVAL_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = PoolConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.inactive_reader_ttl, Duration::from_secs(5));
        assert_eq!(config.inactive_writer_ttl, Duration::from_secs(600));
        assert_eq!(config.reader_pool_max_segments, 3);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_segments_is_clamped() {
        let config = PoolConfig {
            reader_pool_max_segments: 0,
            ..PoolConfig::default()
        };
        assert_eq!(config.max_segments(), 1);
    }
}
