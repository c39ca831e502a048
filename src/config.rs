//! Engine configuration
//!
//! All knobs have defaults; `EngineConfig::from_env` overlays `CHRONICLE_*`
//! environment variables on top of them.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Configuration for the engine and its pipeline stages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Contiguous versions held by one event-cache page
    pub cache_size_per_item: usize,
    /// Upper bound on live transient events
    pub transient_max_items: usize,
    /// Debounce interval of the transient sweep
    #[serde(with = "millis")]
    pub transient_sweep_interval: Duration,
    /// Lifetime given to transient events published without one
    #[serde(with = "millis")]
    pub transient_default_ttl: Duration,
    /// Conflict retries before the factory gives up
    pub retry_max_times: usize,
    #[serde(with = "millis")]
    pub retry_min_delay: Duration,
    #[serde(with = "millis")]
    pub retry_max_delay: Duration,
    /// Actor used for side effects triggered by unattributed events
    pub system_actor: String,
    /// Directory of the durable JSONL log
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size_per_item: 1024,
            transient_max_items: 10_000,
            transient_sweep_interval: Duration::from_secs(1),
            transient_default_ttl: Duration::from_secs(60),
            retry_max_times: 10,
            retry_min_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(500),
            system_actor: "system".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `CHRONICLE_*` environment variables
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse("CHRONICLE_CACHE_SIZE_PER_ITEM") {
            config.cache_size_per_item = size;
        }
        if let Some(max) = env_parse("CHRONICLE_TRANSIENT_MAX_ITEMS") {
            config.transient_max_items = max;
        }
        if let Some(ms) = env_parse("CHRONICLE_TRANSIENT_SWEEP_MS") {
            config.transient_sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHRONICLE_TRANSIENT_TTL_MS") {
            config.transient_default_ttl = Duration::from_millis(ms);
        }
        if let Some(times) = env_parse("CHRONICLE_RETRY_MAX_TIMES") {
            config.retry_max_times = times;
        }
        if let Some(ms) = env_parse("CHRONICLE_RETRY_MIN_DELAY_MS") {
            config.retry_min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHRONICLE_RETRY_MAX_DELAY_MS") {
            config.retry_max_delay = Duration::from_millis(ms);
        }
        if let Ok(actor) = env::var("CHRONICLE_SYSTEM_ACTOR") {
            if !actor.is_empty() {
                config.system_actor = actor;
            }
        }
        if let Ok(dir) = env::var("CHRONICLE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, data_dir: P) -> Self {
        self.data_dir = data_dir.as_ref().to_path_buf();
        self
    }

    pub fn with_cache_size_per_item(mut self, size: usize) -> Self {
        self.cache_size_per_item = size.max(1);
        self
    }

    pub fn with_transient_limits(mut self, max_items: usize, sweep_interval: Duration) -> Self {
        self.transient_max_items = max_items;
        self.transient_sweep_interval = sweep_interval;
        self
    }

    pub fn with_transient_ttl(mut self, ttl: Duration) -> Self {
        self.transient_default_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, max_times: usize, min_delay: Duration, max_delay: Duration) -> Self {
        self.retry_max_times = max_times;
        self.retry_min_delay = min_delay;
        self.retry_max_delay = max_delay;
        self
    }

    pub fn with_system_actor(mut self, actor: impl Into<String>) -> Self {
        self.system_actor = actor.into();
        self
    }

    /// Path to events.jsonl
    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "ignoring unparseable config override");
            None
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
