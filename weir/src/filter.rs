//! Per-adapter filter instances: lifecycle state machine, pending-packet
//! accounting and the process-wide registry that owns them.

pub mod error;
pub mod instance;
pub mod registry;
