//! Process runtime: CLI, configuration, context construction and
//! shutdown sequencing.

pub mod cli;
pub mod conf;
pub mod conf_serde;
pub mod context;
pub mod shutdown;
