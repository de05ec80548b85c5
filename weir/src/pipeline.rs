//! The packet interception data path and the lifecycle operations of the
//! host-framework boundary.
//!
//! [`PacketPipeline`] is the single interface the host adapter drives: the
//! four hook entry points (`inbound_accept`, `inbound_complete`,
//! `outbound_accept`, `outbound_complete`) plus attach/restart/pause/detach.
//! Hook methods are plain synchronous calls that never suspend and never
//! allocate on the verdict path; the only lock they touch is the registry
//! guard for an O(1) handle lookup and the writer-side guard that funnels
//! concurrent capture sources into the ring's single logical writer.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use weir_common::{capture, Direction, PacketMeta};

use crate::{
    filter::{
        error::FilterError,
        instance::{FilterInstance, InstanceId, LifecycleState, PauseStatus},
        registry::FilterRegistry,
    },
    metrics::registry as metrics,
    packet::{Packet, PacketBatch},
    ring::RingProducer,
    rules::{RulesHost, Verdict},
};

/// Largest possible capture record: header, metadata, truncated frame.
const CAPTURE_RECORD_MAX: usize =
    capture::HEADER_LEN + std::mem::size_of::<PacketMeta>() + capture::SNAP_LEN;

/// Global disposition counters, shared between the hot path and the
/// control channel's stats query.
#[derive(Default)]
pub struct PipelineStats {
    allowed: AtomicU64,
    dropped: AtomicU64,
    captured: AtomicU64,
    capture_dropped: AtomicU64,
    bypassed: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            captured: self.captured.load(Ordering::Relaxed),
            capture_dropped: self.capture_dropped.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the global counters, as serialized into the
/// stats-query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub allowed: u64,
    pub dropped: u64,
    pub captured: u64,
    pub capture_dropped: u64,
    pub bypassed: u64,
}

/// Per-batch tallies applied to the shared counters once, after the loop.
#[derive(Default)]
struct BatchTally {
    allowed: u64,
    dropped: u64,
    captured: u64,
    capture_dropped: u64,
    bypassed: u64,
    eval_failures: u64,
}

pub struct PacketPipeline {
    registry: Arc<FilterRegistry>,
    rules: Arc<RulesHost>,
    capture_tx: spin::Mutex<RingProducer>,
    stats: PipelineStats,
    /// Version handed to newly attached instances; the control channel
    /// refreshes it after every rule-set load.
    ruleset_version: AtomicU64,
}

impl PacketPipeline {
    pub fn new(
        registry: Arc<FilterRegistry>,
        rules: Arc<RulesHost>,
        capture_tx: RingProducer,
    ) -> Self {
        Self {
            registry,
            rules,
            capture_tx: spin::Mutex::new(capture_tx),
            stats: PipelineStats::default(),
            ruleset_version: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    pub fn rules(&self) -> &Arc<RulesHost> {
        &self.rules
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Attach the filter to an adapter. The new instance starts `Paused`;
    /// packets flow only after [`restart`].
    ///
    /// [`restart`]: PacketPipeline::restart
    pub fn attach(&self, adapter: &str) -> Result<InstanceId, FilterError> {
        let version = self.ruleset_version.load(Ordering::Acquire);
        let instance = self.registry.register(adapter, version)?;
        if let Err(e) = instance.complete_attach() {
            // Roll the registration back before the error surfaces.
            self.registry.rollback(instance.id());
            return Err(e);
        }
        metrics::INSTANCES_ACTIVE.inc();
        metrics::LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&["attach"])
            .inc();
        info!(
            event.name = "filter.attached",
            instance.id = %instance.id(),
            adapter = adapter,
            "filter instance attached"
        );
        Ok(instance.id())
    }

    /// `Paused -> Running`: enable packet acceptance for this adapter.
    pub fn restart(&self, id: InstanceId) -> Result<(), FilterError> {
        let instance = self.instance(id)?;
        instance.restart()?;
        metrics::LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&["restart"])
            .inc();
        info!(
            event.name = "filter.restarted",
            instance.id = %id,
            adapter = instance.adapter(),
            "filter instance running"
        );
        Ok(())
    }

    /// Stop accepting new packets immediately; the transition to `Paused`
    /// completes once every outstanding packet has been completed.
    pub fn pause(&self, id: InstanceId) -> Result<PauseStatus, FilterError> {
        let instance = self.instance(id)?;
        let status = instance.request_pause()?;
        let status_str = match status {
            PauseStatus::Paused => "paused",
            PauseStatus::Draining => "draining",
        };
        metrics::LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&["pause"])
            .inc();
        info!(
            event.name = "filter.pause_requested",
            instance.id = %id,
            adapter = instance.adapter(),
            pause.status = status_str,
            pending.send = instance.pending_send(),
            pending.recv = instance.pending_recv(),
            "pause requested"
        );
        Ok(status)
    }

    /// Await the completion of a pause. Control context only.
    pub async fn wait_paused(&self, id: InstanceId) -> Result<(), FilterError> {
        let instance = self.instance(id)?;
        instance.wait_paused().await;
        Ok(())
    }

    /// Tear down a paused instance and release its registry slot.
    pub fn detach(&self, id: InstanceId) -> Result<(), FilterError> {
        let instance = self.instance(id)?;
        instance.detach()?;
        self.registry.unregister(id)?;
        metrics::INSTANCES_ACTIVE.dec();
        metrics::LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&["detach"])
            .inc();
        info!(
            event.name = "filter.detached",
            instance.id = %id,
            adapter = instance.adapter(),
            "filter instance detached"
        );
        Ok(())
    }

    /// Seed value for instances attached from now on, refreshed by the
    /// control channel after each rule-set load.
    pub fn note_ruleset_version(&self, version: u64) {
        self.ruleset_version.store(version, Ordering::Release);
        metrics::RULESET_VERSION.set(version as i64);
    }

    fn instance(&self, id: InstanceId) -> Result<Arc<FilterInstance>, FilterError> {
        self.registry
            .get(id)
            .ok_or(FilterError::UnknownInstance { id })
    }

    // ------------------------------------------------------------------
    // Hook entry points
    // ------------------------------------------------------------------

    /// Adapter delivered a batch travelling up toward the protocol stack.
    pub fn inbound_accept(&self, id: InstanceId, batch: PacketBatch) -> PacketBatch {
        self.accept(id, batch, Direction::Ingress)
    }

    /// The upper layer finished with previously forwarded inbound packets.
    pub fn inbound_complete(&self, id: InstanceId, batch: PacketBatch) {
        self.complete(id, batch, Direction::Ingress);
    }

    /// The upper layer handed down a batch travelling toward the adapter.
    pub fn outbound_accept(&self, id: InstanceId, batch: PacketBatch) -> PacketBatch {
        self.accept(id, batch, Direction::Egress)
    }

    /// The adapter finished with previously forwarded outbound packets.
    pub fn outbound_complete(&self, id: InstanceId, batch: PacketBatch) {
        self.complete(id, batch, Direction::Egress);
    }

    fn accept(&self, id: InstanceId, mut batch: PacketBatch, direction: Direction) -> PacketBatch {
        let Some(instance) = self.registry.get(id) else {
            warn!(
                event.name = "pipeline.unknown_instance",
                instance.id = %id,
                "accept hook called for an unregistered instance; passing batch through"
            );
            return batch;
        };

        if instance.state() != LifecycleState::Running {
            // Fast bypass: no accounting, no classification.
            self.stats
                .bypassed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            metrics::PACKETS_TOTAL
                .with_label_values(&[direction.as_str(), "bypassed"])
                .inc_by(batch.len() as u64);
            return batch;
        }

        let engine = self.rules.engine();
        let version = instance.ruleset_version();
        let mut tally = BatchTally::default();

        batch.packets_mut().retain_mut(|packet| {
            instance.packet_accepted(direction);
            if instance.state() != LifecycleState::Running {
                // A pause landed between the batch-level gate and this
                // packet. Undo the count and hand the packet through
                // untracked so the drain the pause is waiting on stays
                // exact.
                instance.packet_completed(direction);
                tally.bypassed += 1;
                return true;
            }
            packet.mark_tracked();
            let verdict = match engine.evaluate(&packet.meta, version) {
                Ok(verdict) => verdict,
                Err(_) => {
                    // Fail closed: a corrupted rule table never lets a
                    // packet through.
                    tally.eval_failures += 1;
                    Verdict::Drop
                }
            };
            match verdict {
                Verdict::Allow => {
                    tally.allowed += 1;
                    true
                }
                Verdict::Capture => {
                    tally.captured += 1;
                    if !self.capture(&instance, packet) {
                        tally.capture_dropped += 1;
                    }
                    true
                }
                Verdict::Drop => {
                    tally.dropped += 1;
                    instance.packet_completed(direction);
                    false
                }
            }
        });

        self.apply_tally(direction, &tally);
        if tally.eval_failures > 0 {
            warn!(
                event.name = "pipeline.rule_eval_failed",
                instance.id = %id,
                adapter = instance.adapter(),
                packet.count = tally.eval_failures,
                "rule evaluation failed; packets dropped fail-closed"
            );
        }
        batch
    }

    fn complete(&self, id: InstanceId, batch: PacketBatch, direction: Direction) {
        let Some(instance) = self.registry.get(id) else {
            warn!(
                event.name = "pipeline.unknown_instance",
                instance.id = %id,
                "complete hook called for an unregistered instance"
            );
            return;
        };
        for packet in batch.into_packets() {
            if packet.is_tracked() {
                instance.packet_completed(direction);
            }
        }
    }

    /// Best-effort publication of a capture record. Failure is silent
    /// except for the counters.
    fn capture(&self, instance: &FilterInstance, packet: &Packet) -> bool {
        let frame = packet.frame();
        let snap = frame.len().min(capture::SNAP_LEN);
        let header = capture::CaptureHeader {
            instance_id: instance.id().0,
            orig_len: frame.len() as u32,
            snap_len: snap as u32,
        };

        let mut record = [0u8; CAPTURE_RECORD_MAX];
        let meta_bytes = packet.meta.as_bytes();
        let mut len = 0;
        record[..capture::HEADER_LEN].copy_from_slice(&header.to_bytes());
        len += capture::HEADER_LEN;
        record[len..len + meta_bytes.len()].copy_from_slice(meta_bytes);
        len += meta_bytes.len();
        record[len..len + snap].copy_from_slice(&frame[..snap]);
        len += snap;

        match self.capture_tx.lock().write_record(&record[..len]) {
            Ok(()) => {
                metrics::RING_WRITES_TOTAL.with_label_values(&["ok"]).inc();
                metrics::RING_BYTES_TOTAL.inc_by((4 + len) as u64);
                true
            }
            Err(e) => {
                metrics::RING_WRITES_TOTAL
                    .with_label_values(&["full"])
                    .inc();
                metrics::CAPTURE_DROPS_TOTAL.inc();
                debug!(
                    event.name = "pipeline.capture_dropped",
                    instance.id = %instance.id(),
                    error.message = %e,
                    "capture record dropped"
                );
                false
            }
        }
    }

    fn apply_tally(&self, direction: Direction, tally: &BatchTally) {
        let dropped = tally.dropped + tally.eval_failures;
        self.stats.allowed.fetch_add(tally.allowed, Ordering::Relaxed);
        self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.stats
            .captured
            .fetch_add(tally.captured, Ordering::Relaxed);
        self.stats
            .capture_dropped
            .fetch_add(tally.capture_dropped, Ordering::Relaxed);
        self.stats
            .bypassed
            .fetch_add(tally.bypassed, Ordering::Relaxed);

        let dir = direction.as_str();
        if tally.allowed > 0 {
            metrics::PACKETS_TOTAL
                .with_label_values(&[dir, "allowed"])
                .inc_by(tally.allowed);
        }
        if dropped > 0 {
            metrics::PACKETS_TOTAL
                .with_label_values(&[dir, "dropped"])
                .inc_by(dropped);
        }
        if tally.captured > 0 {
            metrics::PACKETS_TOTAL
                .with_label_values(&[dir, "captured"])
                .inc_by(tally.captured);
        }
        if tally.bypassed > 0 {
            metrics::PACKETS_TOTAL
                .with_label_values(&[dir, "bypassed"])
                .inc_by(tally.bypassed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        ring::RingBuffer,
        rules::{RuleEngine, RuleEvaluationError},
    };

    /// Engine that replays a scripted verdict sequence, then allows.
    struct ScriptedEngine {
        script: Mutex<Vec<Result<Verdict, ()>>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<Verdict, ()>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    impl RuleEngine for ScriptedEngine {
        fn evaluate(
            &self,
            _meta: &PacketMeta,
            _ruleset_version: u64,
        ) -> Result<Verdict, RuleEvaluationError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(Verdict::Allow);
            }
            script.remove(0).map_err(|_| RuleEvaluationError::Corrupted {
                reason: "scripted failure".to_string(),
            })
        }

        fn load(&self, _ruleset: &[u8]) -> Result<u64, RuleEvaluationError> {
            Ok(1)
        }
    }

    fn pipeline_with(engine: Arc<dyn RuleEngine>) -> PacketPipeline {
        let (tx, _rx) = RingBuffer::with_capacity(1 << 16).split();
        PacketPipeline::new(
            Arc::new(FilterRegistry::new()),
            Arc::new(RulesHost::new(engine)),
            tx,
        )
    }

    fn batch(direction: Direction, ports: &[u16]) -> PacketBatch {
        let packets = ports
            .iter()
            .map(|&port| {
                let mut meta = PacketMeta::default();
                meta.dst_port = port.to_be_bytes();
                meta.direction = direction;
                Packet::new(meta, vec![0xab; 64])
            })
            .collect();
        PacketBatch::from_packets(direction, packets)
    }

    #[test]
    fn batch_while_paused_bypasses_uncounted() {
        let pipeline = pipeline_with(Arc::new(ScriptedEngine::new(vec![])));
        let id = pipeline.attach("eth0").unwrap();

        let out = pipeline.inbound_accept(id, batch(Direction::Ingress, &[80, 443]));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| !p.is_tracked()));

        let instance = pipeline.registry().get(id).unwrap();
        assert_eq!(instance.pending_recv(), 0);
        assert_eq!(pipeline.stats().snapshot().bypassed, 2);
    }

    #[test]
    fn drop_splits_batch_without_reordering() {
        let engine = ScriptedEngine::new(vec![
            Ok(Verdict::Allow),
            Ok(Verdict::Drop),
            Ok(Verdict::Allow),
        ]);
        let pipeline = pipeline_with(Arc::new(engine));
        let id = pipeline.attach("eth0").unwrap();
        pipeline.restart(id).unwrap();

        let out = pipeline.inbound_accept(id, batch(Direction::Ingress, &[1, 2, 3]));
        let survivors: Vec<u16> = out.iter().map(|p| p.meta.dst_port()).collect();
        assert_eq!(survivors, vec![1, 3]);

        let instance = pipeline.registry().get(id).unwrap();
        // The dropped packet was decremented immediately.
        assert_eq!(instance.pending_recv(), 2);

        pipeline.inbound_complete(id, out);
        assert_eq!(instance.pending_recv(), 0);

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn forwarded_plus_dropped_equals_batch_size() {
        let engine = ScriptedEngine::new(vec![
            Ok(Verdict::Drop),
            Ok(Verdict::Allow),
            Ok(Verdict::Capture),
            Ok(Verdict::Drop),
        ]);
        let pipeline = pipeline_with(Arc::new(engine));
        let id = pipeline.attach("eth0").unwrap();
        pipeline.restart(id).unwrap();

        let out = pipeline.outbound_accept(id, batch(Direction::Egress, &[1, 2, 3, 4]));
        let stats = pipeline.stats().snapshot();
        assert_eq!(out.len() as u64 + stats.dropped, 4);
        assert_eq!(stats.allowed + stats.captured, out.len() as u64);
    }

    #[test]
    fn eval_failure_is_fail_closed() {
        let engine = ScriptedEngine::new(vec![Err(()), Ok(Verdict::Allow)]);
        let pipeline = pipeline_with(Arc::new(engine));
        let id = pipeline.attach("eth0").unwrap();
        pipeline.restart(id).unwrap();

        let out = pipeline.inbound_accept(id, batch(Direction::Ingress, &[7, 8]));
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().unwrap().meta.dst_port(), 8);
        assert_eq!(pipeline.stats().snapshot().dropped, 1);

        let instance = pipeline.registry().get(id).unwrap();
        assert_eq!(instance.pending_recv(), 1);
    }

    #[test]
    fn capture_publishes_record_and_survives_full_ring() {
        let (tx, mut rx) = RingBuffer::with_capacity(256).split();
        let engine = ScriptedEngine::new(vec![Ok(Verdict::Capture); 8]);
        let pipeline = PacketPipeline::new(
            Arc::new(FilterRegistry::new()),
            Arc::new(RulesHost::new(Arc::new(engine))),
            tx,
        );
        let id = pipeline.attach("eth0").unwrap();
        pipeline.restart(id).unwrap();

        let out = pipeline.inbound_accept(id, batch(Direction::Ingress, &[1, 2, 3, 4, 5, 6, 7, 8]));
        // Capture never drops the packets themselves.
        assert_eq!(out.len(), 8);

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.captured, 8);
        assert!(stats.capture_dropped > 0, "256-byte ring cannot hold 8 records");

        // The records that did fit parse back.
        let record = rx.next_record().unwrap();
        let header = capture::CaptureHeader::from_bytes(&record).unwrap();
        assert_eq!(header.instance_id, id.0);
        assert_eq!(header.orig_len, 64);
        let meta = PacketMeta::from_bytes(&record[capture::HEADER_LEN..]).unwrap();
        assert_eq!(meta.dst_port(), 1);
    }

    #[test]
    fn detach_frees_the_slot() {
        let pipeline = pipeline_with(Arc::new(ScriptedEngine::new(vec![])));
        let id = pipeline.attach("eth0").unwrap();
        pipeline.restart(id).unwrap();
        assert!(matches!(
            pipeline.detach(id),
            Err(FilterError::State { .. })
        ));
        assert_eq!(pipeline.pause(id).unwrap(), PauseStatus::Paused);
        pipeline.detach(id).unwrap();
        assert!(pipeline.registry().is_empty());
        assert!(matches!(
            pipeline.restart(id),
            Err(FilterError::UnknownInstance { .. })
        ));
    }
}
