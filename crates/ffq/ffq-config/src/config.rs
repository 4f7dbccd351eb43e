use ffq_queue::{Backoff, QueueConfig, SyncOptions, SyncStrategy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FfqConfig {
    /// Backing file for the queue region. Without one the run uses
    /// anonymous memory shared by threads.
    pub shm_file_path: Option<String>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::consumers")]
    pub consumers: usize,
    #[serde(default = "defaults::items")]
    pub items: u64,
    #[serde(default = "defaults::producer_delay_ms")]
    pub producer_delay_ms: u64,
    #[serde(default = "defaults::consumer_delay_ms")]
    pub consumer_delay_ms: u64,
    #[serde(default)]
    pub strategy: StrategyName,
    /// Replaces the strategy's own backoff policy.
    pub backoff: Option<BackoffConfig>,
    /// Replaces the strategy's retry ceiling; `0` means a single attempt.
    pub max_retries: Option<u32>,
    #[serde(default = "defaults::lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    pub csv_file: Option<String>,
    pub result_file: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Generated items; consumers stop once the completion counter reaches `items`.
    #[default]
    Test,
    /// Generated items closed with one sentinel per consumer, timed.
    Benchmark,
    /// Weather readings read from `csv_file`, closed with sentinels.
    File,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyName {
    Baseline,
    #[default]
    Batched,
}

impl From<StrategyName> for SyncStrategy {
    fn from(name: StrategyName) -> Self {
        match name {
            StrategyName::Baseline => SyncStrategy::Baseline,
            StrategyName::Batched => SyncStrategy::Batched,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffConfig {
    Fixed { delay_us: u64 },
    Exponential { initial_us: u64, max_us: u64 },
}

impl From<BackoffConfig> for Backoff {
    fn from(cfg: BackoffConfig) -> Self {
        match cfg {
            BackoffConfig::Fixed { delay_us } => Backoff::Fixed(Duration::from_micros(delay_us)),
            BackoffConfig::Exponential { initial_us, max_us } => Backoff::Exponential {
                initial: Duration::from_micros(initial_us),
                max: Duration::from_micros(max_us),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn capacity() -> usize {
        4
    }

    pub fn consumers() -> usize {
        3
    }

    pub fn items() -> u64 {
        10
    }

    pub fn producer_delay_ms() -> u64 {
        50
    }

    pub fn consumer_delay_ms() -> u64 {
        200
    }

    pub fn lock_timeout_ms() -> u64 {
        5_000
    }
}

impl Default for FfqConfig {
    fn default() -> Self {
        Self {
            shm_file_path: None,
            log_level: defaults::log_level(),
            mode: RunMode::default(),
            capacity: defaults::capacity(),
            consumers: defaults::consumers(),
            items: defaults::items(),
            producer_delay_ms: defaults::producer_delay_ms(),
            consumer_delay_ms: defaults::consumer_delay_ms(),
            strategy: StrategyName::default(),
            backoff: None,
            max_retries: None,
            lock_timeout_ms: defaults::lock_timeout_ms(),
            csv_file: None,
            result_file: None,
        }
    }
}

impl FfqConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&toml_to_str)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let ffq_config: FfqConfig = toml::from_str(s)?;
        ffq_config.validate()?;
        Ok(ffq_config)
    }

    /// Rejects settings that would fail before the first enqueue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity < 1 {
            return Err(ConfigError::Invalid(format!(
                "capacity must be at least 1, got {}",
                self.capacity
            )));
        }
        if self.consumers == 0 {
            return Err(ConfigError::Invalid("consumers must be at least 1".into()));
        }
        if self.items == 0 && self.mode != RunMode::File {
            return Err(ConfigError::Invalid("items must be at least 1".into()));
        }
        if self.mode == RunMode::File && self.csv_file.is_none() {
            return Err(ConfigError::Invalid("file mode needs csv_file".into()));
        }
        if let Some(BackoffConfig::Exponential { initial_us, max_us }) = self.backoff {
            if initial_us > max_us {
                return Err(ConfigError::Invalid(format!(
                    "backoff initial_us {initial_us} exceeds max_us {max_us}"
                )));
            }
        }
        Ok(())
    }

    pub fn sync_options(&self) -> SyncOptions {
        let mut opts = SyncOptions::new(self.strategy.into())
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms));
        if let Some(backoff) = self.backoff {
            opts = opts.with_backoff(backoff.into());
        }
        if let Some(max) = self.max_retries {
            opts = opts.with_max_retries(Some(max));
        }
        opts
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.capacity).with_options(self.sync_options())
    }

    pub fn producer_delay(&self) -> Duration {
        Duration::from_millis(self.producer_delay_ms)
    }

    pub fn consumer_delay(&self) -> Duration {
        Duration::from_millis(self.consumer_delay_ms)
    }
}
