//! Error types for the control channel.

use std::io;

use thiserror::Error;
use weir_common::control as wire;

#[derive(Debug, Error)]
pub enum ControlError {
    /// A session is already open; only one manager conversation exists at
    /// a time.
    #[error("control session already open")]
    Busy,

    /// The request frame could not be understood.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// The session was torn down while an operation was outstanding.
    #[error("control session closed")]
    SessionClosed,

    /// Transport failure on the entry point.
    #[error("control transport error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    /// Wire status code reported to the manager.
    pub fn status_code(&self) -> u32 {
        match self {
            ControlError::Busy => wire::STATUS_BUSY,
            ControlError::Protocol { .. } => wire::STATUS_PROTOCOL,
            ControlError::SessionClosed => wire::STATUS_PROTOCOL,
            ControlError::Io(_) => wire::STATUS_PROTOCOL,
        }
    }
}
