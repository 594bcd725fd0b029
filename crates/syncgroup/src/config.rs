use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty output on a terminal, simplified output otherwise
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The level below which logs are dropped, unless `RUST_LOG` says otherwise.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Forces backtraces on for panics and errors.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Controls where metrics are reported to.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Metrics are not reported if this is missing.
    pub statsd: Option<String>,
    /// The prefix of every metric name.
    pub prefix: String,
    /// Tags that are attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "syncgroup".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The configuration of a process using the primitives, see [`crate::logging::init_logging`]
/// and [`crate::metrics::configure_statsd`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or returns the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed to read config file")?;
        // An empty document would silently yield the defaults.
        if config.trim().is_empty() {
            anyhow::bail!("config file is empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Reports metrics to statsd, if a server is configured.
    pub fn configure_metrics(&self) -> Result<()> {
        match &self.metrics.statsd {
            Some(statsd) => crate::metrics::configure_statsd(
                &self.metrics.prefix,
                statsd.as_str(),
                self.metrics.custom_tags.clone(),
            ),
            None => Ok(()),
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::unknown_variant(&level, &["off", "error", "warn", "info", "debug", "trace"])
    })
}
