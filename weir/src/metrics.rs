//! Prometheus metrics collection and HTTP server.
//!
//! All collectors live in a process-wide registry under the `weir`
//! namespace, one subsystem per component. The server exposes them at
//! `/metrics` for scraping.

pub mod error;
pub mod opts;
pub mod registry;
pub mod server;
