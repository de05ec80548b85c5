//! Shutdown sequencing: drain every running instance, then detach.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    filter::instance::{LifecycleState, PauseStatus},
    pipeline::PacketPipeline,
};

/// Pause each running instance, wait up to `timeout` for its outstanding
/// packets to drain, then detach everything that reached `Paused`.
///
/// An instance whose packets do not drain in time is left attached: its
/// state may still be referenced by in-flight packets, and tearing it down
/// anyway is exactly the use-after-free the counters exist to prevent.
pub async fn drain_and_detach(pipeline: &Arc<PacketPipeline>, timeout: Duration) {
    for instance in pipeline.registry().snapshot() {
        let id = instance.id();

        if instance.state() == LifecycleState::Running {
            match pipeline.pause(id) {
                Ok(PauseStatus::Paused) => {}
                Ok(PauseStatus::Draining) => {
                    if tokio::time::timeout(timeout, pipeline.wait_paused(id))
                        .await
                        .is_err()
                    {
                        warn!(
                            event.name = "shutdown.drain_timeout",
                            instance.id = %id,
                            adapter = instance.adapter(),
                            pending.send = instance.pending_send(),
                            pending.recv = instance.pending_recv(),
                            "instance did not drain in time; leaving it attached"
                        );
                        continue;
                    }
                }
                Err(e) => {
                    warn!(
                        event.name = "shutdown.pause_failed",
                        instance.id = %id,
                        error.message = %e,
                        "pause failed during shutdown"
                    );
                    continue;
                }
            }
        }

        if instance.state() == LifecycleState::Paused {
            if let Err(e) = pipeline.detach(id) {
                warn!(
                    event.name = "shutdown.detach_failed",
                    instance.id = %id,
                    error.message = %e,
                    "detach failed during shutdown"
                );
            }
        }
    }

    info!(
        event.name = "shutdown.complete",
        instances.remaining = pipeline.registry().len(),
        "filter shutdown sequence finished"
    );
}
