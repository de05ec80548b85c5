//! Error types for instance lifecycle and registry operations.

use thiserror::Error;

use crate::filter::instance::{InstanceId, LifecycleState};

#[derive(Debug, Error)]
pub enum FilterError {
    /// Illegal lifecycle transition. State is unchanged.
    #[error("instance {id}: cannot {attempted} while {from}")]
    State {
        id: InstanceId,
        from: LifecycleState,
        attempted: &'static str,
    },

    /// Allocation failed. The operation was rolled back locally.
    #[error("resource allocation failed: {reason}")]
    Resource { reason: String },

    /// The identifier does not name a registered instance.
    #[error("unknown filter instance {id}")]
    UnknownInstance { id: InstanceId },
}
