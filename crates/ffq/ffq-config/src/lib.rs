mod config;

pub use config::{BackoffConfig, ConfigError, FfqConfig, RunMode, StrategyName};
