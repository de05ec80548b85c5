//! Application configuration.
//!
//! Precedence, lowest to highest: built-in defaults, configuration file,
//! `WEIR_`-prefixed environment variables, CLI arguments.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::{
    metrics::opts::MetricsOptions,
    runtime::{
        cli::Cli,
        conf_serde::{duration, level},
    },
};

mod defaults {
    use std::{path::PathBuf, time::Duration};

    pub fn ring_capacity() -> usize {
        crate::ring::DEFAULT_CAPACITY
    }

    pub fn control_socket() -> PathBuf {
        PathBuf::from("/run/weir/control.sock")
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Adapters (network interfaces) to attach to at startup. Each entry
    /// becomes one filter instance, attached and restarted in order.
    #[serde(default)]
    pub adapters: Vec<String>,

    /// The logging level for the application.
    #[serde(with = "level")]
    pub log_level: Level,

    /// Configuration for the metrics server (Prometheus scraping).
    #[serde(default)]
    pub metrics: MetricsOptions,

    /// Capacity of the capture ring channel in bytes. Must be a power of
    /// two.
    /// - Default: 1048576 (1 MiB)
    #[serde(default = "defaults::ring_capacity")]
    pub ring_capacity: usize,

    /// Path of the control entry-point socket.
    #[serde(default = "defaults::control_socket")]
    pub control_socket: PathBuf,

    /// Maximum time to wait for an instance's outstanding packets to drain
    /// during shutdown.
    /// - Default: 5s
    #[serde(default = "defaults::shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,

    /// Path the configuration was loaded from, kept for diagnostics.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            log_level: Level::INFO,
            metrics: MetricsOptions::default(),
            ring_capacity: defaults::ring_capacity(),
            control_socket: defaults::control_socket(),
            shutdown_timeout: defaults::shutdown_timeout(),
            config_path: None,
        }
    }
}

impl Conf {
    /// Merges a configuration file into a Figment instance, selecting the
    /// provider from the file extension.
    fn merge_provider_for_path(figment: Figment, path: &Path) -> Result<Figment, ConfError> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Ok(figment.merge(Yaml::file(path))),
            Some(ext) => Err(ConfError::InvalidExtension(ext.to_string())),
            None => Err(ConfError::InvalidExtension("none".to_string())),
        }
    }

    pub fn new(cli: Cli) -> Result<Self, ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path = cli.config.clone();
        if let Some(path) = &config_path {
            figment = Self::merge_provider_for_path(figment, path)?;
        }

        figment = figment
            .merge(Env::prefixed("WEIR_"))
            .merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = config_path;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<(), ConfError> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfError::InvalidRingCapacity(self.ring_capacity));
        }
        // Anything smaller cannot hold a single capture record.
        if self.ring_capacity < 4096 {
            return Err(ConfError::InvalidRingCapacity(self.ring_capacity));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("unsupported config file extension: {0}")]
    InvalidExtension(String),

    #[error("ring capacity must be a power of two of at least 4096, got {0}")]
    InvalidRingCapacity(usize),

    #[error("configuration error: {0}")]
    Extraction(#[from] figment::Error),
}
