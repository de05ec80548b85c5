//! Single-session control dispatcher.
//!
//! [`ControlChannel`] owns the ring consumer and the session slot. Opening
//! a session loans the consumer out; a second open while one is active
//! fails with [`ControlError::Busy`]. Teardown (explicit close or dropping
//! the session) cancels any suspended ring read and releases the slot so a
//! new session can open.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{info, warn};
use weir_common::control as wire;

use crate::{
    control::{
        error::ControlError,
        request::{ControlResponse, InstanceStats, StatsReport},
    },
    metrics::registry as metrics,
    pipeline::PacketPipeline,
    ring::{RingCancelToken, RingConsumer},
};

/// Largest single drain handed back in one `RING_DRAIN` response.
const DRAIN_CHUNK: usize = 64 * 1024;

struct ChannelInner {
    pipeline: Arc<PacketPipeline>,
    consumer_slot: Mutex<Option<RingConsumer>>,
    session_open: AtomicBool,
    /// Cancels the active session's suspended read from outside the
    /// session, e.g. at filter shutdown.
    cancel: RingCancelToken,
}

/// Cheaply cloneable handle to the one control channel of the filter core.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ChannelInner>,
}

impl ControlChannel {
    pub fn new(pipeline: Arc<PacketPipeline>, consumer: RingConsumer) -> Self {
        let cancel = consumer.cancel_token();
        Self {
            inner: Arc::new(ChannelInner {
                pipeline,
                consumer_slot: Mutex::new(Some(consumer)),
                session_open: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Open the one manager session. Fails with [`ControlError::Busy`]
    /// while another session is active.
    pub fn open(&self) -> Result<ControlSession, ControlError> {
        let inner = &self.inner;
        if inner
            .session_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControlError::Busy);
        }
        let Some(mut consumer) = inner
            .consumer_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            // Slot empty while the flag was clear: give the flag back
            // rather than wedging the channel.
            inner.session_open.store(false, Ordering::Release);
            return Err(ControlError::Busy);
        };
        consumer.reset_cancel();
        info!(event.name = "control.session_opened", "control session opened");
        Ok(ControlSession {
            inner: inner.clone(),
            consumer: Some(consumer),
        })
    }

    /// Cancel whatever read the active session has outstanding. Used at
    /// filter shutdown; harmless when no session is open.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl ChannelInner {
    fn release(&self, consumer: RingConsumer) {
        *self
            .consumer_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(consumer);
        self.session_open.store(false, Ordering::Release);
        info!(event.name = "control.session_closed", "control session closed");
    }
}

/// One open manager conversation. Holds the ring consumer for its
/// lifetime; dropping the session releases it.
pub struct ControlSession {
    inner: Arc<ChannelInner>,
    consumer: Option<RingConsumer>,
}

impl ControlSession {
    /// Dispatch one framed request.
    pub async fn call(&mut self, opcode: u32, payload: &[u8]) -> ControlResponse {
        let response = match opcode {
            wire::OP_RULESET_UPDATE => self.ruleset_update(payload),
            wire::OP_STATS_QUERY => self.stats_query(),
            wire::OP_RING_DRAIN => self.ring_drain(payload).await,
            other => {
                warn!(
                    event.name = "control.unknown_opcode",
                    request.opcode = other,
                    "unknown control opcode"
                );
                ControlResponse::status(wire::STATUS_PROTOCOL)
            }
        };
        metrics::CONTROL_REQUESTS_TOTAL
            .with_label_values(&[
                opcode_name(opcode),
                if response.is_ok() { "ok" } else { "error" },
            ])
            .inc();
        response
    }

    /// Replace the rule table and publish the new version to every
    /// attached instance. Response payload: the version id, u64 LE.
    fn ruleset_update(&self, payload: &[u8]) -> ControlResponse {
        let pipeline = &self.inner.pipeline;
        match pipeline.rules().load(payload) {
            Ok(version) => {
                pipeline
                    .registry()
                    .for_each(|instance| instance.set_ruleset_version(version));
                pipeline.note_ruleset_version(version);
                info!(
                    event.name = "control.ruleset_updated",
                    ruleset.version = version,
                    ruleset.bytes = payload.len(),
                    "rule set updated"
                );
                ControlResponse::ok(version.to_le_bytes().to_vec())
            }
            Err(e) => {
                warn!(
                    event.name = "control.ruleset_rejected",
                    error.message = %e,
                    "rule set rejected"
                );
                ControlResponse::status(wire::STATUS_RULE_EVAL)
            }
        }
    }

    /// Global disposition counters plus per-instance pending counters.
    fn stats_query(&self) -> ControlResponse {
        let pipeline = &self.inner.pipeline;
        let mut instances = Vec::new();
        pipeline.registry().for_each(|instance| {
            instances.push(InstanceStats {
                id: instance.id().0,
                adapter: instance.adapter().to_string(),
                state: instance.state().as_str().to_string(),
                pending_send: instance.pending_send(),
                pending_recv: instance.pending_recv(),
                ruleset_version: instance.ruleset_version(),
            });
        });
        let report = StatsReport {
            global: pipeline.stats().snapshot(),
            instances,
        };
        match serde_json::to_vec(&report) {
            Ok(payload) => ControlResponse::ok(payload),
            Err(e) => {
                warn!(
                    event.name = "control.stats_encode_failed",
                    error.message = %e,
                    "failed to encode stats report"
                );
                ControlResponse::status(wire::STATUS_RESOURCE)
            }
        }
    }

    /// Explicit ring flush. An empty request polls; a one-byte `1` payload
    /// suspends until data arrives or the session is torn down.
    async fn ring_drain(&mut self, payload: &[u8]) -> ControlResponse {
        let wait = matches!(payload.first(), Some(1));
        let Some(consumer) = self.consumer.as_mut() else {
            return ControlResponse::status(wire::STATUS_PROTOCOL);
        };
        let mut buf = vec![0u8; DRAIN_CHUNK];
        let n = if wait {
            match consumer.read_wait(&mut buf).await {
                Ok(n) => n,
                // Cancelled: the session is being torn down.
                Err(_) => return ControlResponse::status(wire::STATUS_PROTOCOL),
            }
        } else {
            consumer.read(&mut buf)
        };
        buf.truncate(n);
        ControlResponse::ok(buf)
    }

    /// Non-blocking drain directly into a caller buffer, for entry-point
    /// adapters that expose a raw read call instead of the frame protocol.
    pub fn drain_ring(&mut self, buf: &mut [u8]) -> usize {
        match self.consumer.as_mut() {
            Some(consumer) => consumer.read(buf),
            None => 0,
        }
    }

    /// Explicit close. Equivalent to dropping the session.
    pub fn close(self) {}
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        // Wake any read still parked on the ring, then hand the consumer
        // back so the next session can open.
        self.inner.cancel.cancel();
        if let Some(consumer) = self.consumer.take() {
            self.inner.release(consumer);
        }
    }
}

fn opcode_name(opcode: u32) -> &'static str {
    match opcode {
        wire::OP_RULESET_UPDATE => "ruleset_update",
        wire::OP_STATS_QUERY => "stats_query",
        wire::OP_RING_DRAIN => "ring_drain",
        _ => "unknown",
    }
}
