//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `VOLLEY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `VOLLEY_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `VOLLEY_RATE_LIMITS__DEFAULT_RPM=120` sets the `rate_limits.default_rpm` field.
//!
//! ## Example
//!
//! ```yaml
//! input_dir: batches/incoming
//! output_dir: batches/results
//! processed_dir: batches/processed
//! poll_interval: 5s
//! max_attempts: 3
//! drain_mode: serial
//! rate_limits:
//!   default_rpm: 60
//!   destinations:
//!     openai: 500
//!   models:
//!     openai:
//!       gpt-4o: 100
//!   groups:
//!     nightly: 10
//! destinations:
//!   openai:
//!     url: https://api.openai.com
//!     path: /v1/chat/completions
//!     api_key: sk-...
//!     timeout: 10m
//! ```
//!
//! Rate limits are resolved once per batch, at grouping time, through
//! [`RateLimitConfig::resolve`]. Nothing reads the process environment after loading.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::RateLimit;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "VOLLEY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without processing any batches.
    #[arg(long)]
    pub validate: bool,

    /// Drain the batches currently in the input directory, then exit instead of polling.
    #[arg(long)]
    pub once: bool,
}

/// How many batches may be drained at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// One batch at a time
    #[default]
    Serial,
    /// Up to `max_concurrent_batches` batches at a time
    Concurrent,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory scanned for new batch sources
    pub input_dir: PathBuf,
    /// Directory receiving result logs
    pub output_dir: PathBuf,
    /// Directory drained batch sources are archived into
    pub processed_dir: PathBuf,
    /// File extension identifying batch sources (without the dot)
    pub batch_extension: String,
    /// How long to wait before re-scanning when no batches were found
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Attempts allowed per record, including the first
    pub max_attempts: u32,
    /// Serial (default) or concurrent multi-batch draining
    pub drain_mode: DrainMode,
    /// Upper bound on batches drained together in concurrent mode
    pub max_concurrent_batches: usize,
    /// Interval for logging requests in flight during a drain. None disables it.
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
    /// Requests-per-minute budgets
    pub rate_limits: RateLimitConfig,
    /// HTTP destinations, keyed by destination tag
    pub destinations: BTreeMap<String, DestinationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("batches/incoming"),
            output_dir: PathBuf::from("batches/results"),
            processed_dir: PathBuf::from("batches/processed"),
            batch_extension: "jsonl".to_string(),
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            drain_mode: DrainMode::Serial,
            max_concurrent_batches: 4,
            status_log_interval: None,
            rate_limits: RateLimitConfig::default(),
            destinations: BTreeMap::new(),
        }
    }
}

/// Requests-per-minute budgets, layered from most to least specific.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Budget for queues with no more specific override. `null` makes every queue
    /// require an explicit override.
    pub default_rpm: Option<f64>,
    /// Per-destination budgets
    pub destinations: BTreeMap<String, f64>,
    /// Per-model budgets, keyed by destination then model
    pub models: BTreeMap<String, BTreeMap<String, f64>>,
    /// Budgets for explicit groups
    pub groups: BTreeMap<String, f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rpm: Some(60.0),
            destinations: BTreeMap::new(),
            models: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Resolve the budget for a queue.
    ///
    /// The first configured value in the chain group → (destination, model) →
    /// destination → default wins. An invalid value at that level is an error;
    /// it never falls through to a less specific one.
    pub fn resolve(&self, group: Option<&str>, destination: &str, model: &str) -> Result<RateLimit> {
        let (source, rpm) = if let Some(rpm) = group.and_then(|g| self.groups.get(g)) {
            (format!("rate_limits.groups.{}", group.unwrap_or_default()), *rpm)
        } else if let Some(rpm) = self.models.get(destination).and_then(|m| m.get(model)) {
            (format!("rate_limits.models.{destination}.{model}"), *rpm)
        } else if let Some(rpm) = self.destinations.get(destination) {
            (format!("rate_limits.destinations.{destination}"), *rpm)
        } else if let Some(rpm) = self.default_rpm {
            ("rate_limits.default_rpm".to_string(), rpm)
        } else {
            return Err(Error::Config(format!(
                "no rate limit configured for destination '{destination}', model '{model}' and no default_rpm"
            )));
        };

        RateLimit::new(rpm).map_err(|e| Error::Config(format!("{source}: {e}")))
    }

    /// Every configured value, paired with where it came from.
    fn entries(&self) -> Vec<(String, f64)> {
        let mut entries = Vec::new();
        if let Some(rpm) = self.default_rpm {
            entries.push(("rate_limits.default_rpm".to_string(), rpm));
        }
        for (destination, rpm) in &self.destinations {
            entries.push((format!("rate_limits.destinations.{destination}"), *rpm));
        }
        for (destination, models) in &self.models {
            for (model, rpm) in models {
                entries.push((format!("rate_limits.models.{destination}.{model}"), *rpm));
            }
        }
        for (group, rpm) in &self.groups {
            entries.push((format!("rate_limits.groups.{group}"), *rpm));
        }
        entries
    }
}

/// Connection settings for one HTTP destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DestinationConfig {
    /// Base URL of the endpoint (e.g., "https://api.openai.com")
    pub url: String,
    /// Path appended to the base URL
    pub path: String,
    /// Bearer token, sent in the Authorization header when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Timeout for a single attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            path: "/v1/chat/completions".to_string(),
            api_key: None,
            timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> std::result::Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("VOLLEY_").split("__"))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }

        if self.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "max_concurrent_batches must be at least 1".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "poll_interval must be non-zero to avoid busy-looping".to_string(),
            ));
        }

        if self.batch_extension.is_empty() || self.batch_extension.starts_with('.') {
            return Err(Error::Config(format!(
                "batch_extension must be a bare extension such as 'jsonl', got '{}'",
                self.batch_extension
            )));
        }

        if self.input_dir == self.output_dir
            || self.input_dir == self.processed_dir
            || self.output_dir == self.processed_dir
        {
            return Err(Error::Config(
                "input_dir, output_dir and processed_dir must be distinct".to_string(),
            ));
        }

        for (source, rpm) in self.rate_limits.entries() {
            RateLimit::new(rpm).map_err(|e| Error::Config(format!("{source}: {e}")))?;
        }

        for (tag, destination) in &self.destinations {
            if destination.url.is_empty() {
                return Err(Error::Config(format!("destinations.{tag}.url is required")));
            }
        }

        Ok(())
    }

    /// Number of batches drained together.
    pub fn batch_concurrency(&self) -> usize {
        match self.drain_mode {
            DrainMode::Serial => 1,
            DrainMode::Concurrent => self.max_concurrent_batches,
        }
    }
}
