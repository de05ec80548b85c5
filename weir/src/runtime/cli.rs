use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf_serde::level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "weir.yaml").
    #[arg(short, long, value_name = "FILE", env = "WEIR_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "WEIR_LOG_LEVEL")]
    #[serde(
        default,
        with = "level::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub log_level: Option<Level>,

    /// Path of the control entry-point socket.
    #[arg(long, value_name = "PATH", env = "WEIR_CONTROL_SOCKET")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
}
