use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PAGE_THRESHOLD: u32 = 100;
pub const DEFAULT_UTXOS_PER_FETCH: u32 = 100;

/// Runtime knobs of the index. Missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub mempool_enabled: bool,
    pub worker_threads: usize,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    pub broadcast_timeout_ms: u64,
    pub page_threshold: u32,
    pub utxos_per_fetch: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            mempool_enabled: true,
            worker_threads: 5,
            fetch_timeout_ms: 3000,
            fetch_retries: 1,
            broadcast_timeout_ms: 3000,
            page_threshold: DEFAULT_PAGE_THRESHOLD,
            utxos_per_fetch: DEFAULT_UTXOS_PER_FETCH,
        }
    }
}

impl IndexConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        log::info!("[CONFIG] loaded {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be positive".into()));
        }
        if self.page_threshold == 0 {
            return Err(ConfigError::Invalid("page_threshold must be positive".into()));
        }
        if self.utxos_per_fetch == 0 {
            return Err(ConfigError::Invalid("utxos_per_fetch must be positive".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: IndexConfig = serde_json::from_str(r#"{ "worker_threads": 2 }"#).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.page_threshold, 100);
        assert!(config.mempool_enabled);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = IndexConfig {
            worker_threads: 0,
            ..IndexConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{ "page_threshold": 50, "fetch_timeout_ms": 10 }"#).unwrap();

        let config = IndexConfig::from_json_file(&path).unwrap();
        assert_eq!(config.page_threshold, 50);
        assert_eq!(config.fetch_timeout(), Duration::from_millis(10));
    }
}
