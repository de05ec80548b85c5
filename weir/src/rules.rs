//! Rule-engine integration surface.
//!
//! Packet classification is an external capability consumed through a fixed
//! three-outcome contract: every evaluated packet is allowed, dropped, or
//! allowed-and-captured. The matching algorithm behind that contract is out
//! of scope here; [`RuleEngine`] is the seam a real engine plugs into, and
//! [`BasicRuleEngine`] is the reference implementation the daemon loads so
//! the control channel has something to update end to end.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use thiserror::Error;
use weir_common::PacketMeta;

/// Outcome of classifying one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the packet unchanged.
    Allow,
    /// Release the packet immediately; it never reaches the next layer.
    Drop,
    /// Forward the packet and publish a copy on the ring channel.
    Capture,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Drop => "drop",
            Verdict::Capture => "capture",
        }
    }
}

/// Classification failed. The pipeline maps every evaluation error to
/// [`Verdict::Drop`]: a corrupted rule table must never become fail-open.
#[derive(Debug, Error)]
pub enum RuleEvaluationError {
    #[error("rule table corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("malformed rule set: {reason}")]
    Malformed { reason: String },
}

/// External classification engine.
///
/// `evaluate` runs on the packet hot path: implementations must not block,
/// allocate unboundedly, or suspend. `load` runs on the control path only.
pub trait RuleEngine: Send + Sync {
    /// Classify one packet. `ruleset_version` is the version the calling
    /// instance last observed, letting an engine detect stale callers.
    fn evaluate(
        &self,
        meta: &PacketMeta,
        ruleset_version: u64,
    ) -> Result<Verdict, RuleEvaluationError>;

    /// Replace the predicate table from an opaque rule-set blob, returning
    /// the new version id.
    fn load(&self, ruleset: &[u8]) -> Result<u64, RuleEvaluationError>;
}

/// Shared engine slot.
///
/// Hooks clone the `Arc` under the read guard and evaluate outside it, so
/// a concurrent `RULESET_UPDATE` never blocks the packet path.
pub struct RulesHost {
    engine: spin::RwLock<Arc<dyn RuleEngine>>,
}

impl RulesHost {
    pub fn new(engine: Arc<dyn RuleEngine>) -> Self {
        Self {
            engine: spin::RwLock::new(engine),
        }
    }

    /// Current engine handle. O(1) guard hold.
    #[inline]
    pub fn engine(&self) -> Arc<dyn RuleEngine> {
        self.engine.read().clone()
    }

    /// Swap in a different engine implementation.
    pub fn replace(&self, engine: Arc<dyn RuleEngine>) {
        *self.engine.write() = engine;
    }

    /// Load a new rule set into the current engine.
    pub fn load(&self, ruleset: &[u8]) -> Result<u64, RuleEvaluationError> {
        self.engine().load(ruleset)
    }
}

/// One 8-byte match record of the reference rule-set format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatchRecord {
    /// IP protocol number to match, or `PROTO_ANY`.
    proto: u8,
    verdict: Verdict,
    /// Transport port to match against either endpoint, or 0 for any.
    port: u16,
}

const PROTO_ANY: u8 = 0xff;
const RECORD_LEN: usize = 8;

/// Reference engine: first-match over fixed-size records, allow by default.
///
/// The record format (`proto u8, verdict u8, port u16 LE, reserved u32`) is
/// a placeholder contract for the external manager, not a rule language;
/// nothing outside this module depends on it.
pub struct BasicRuleEngine {
    table: spin::RwLock<Vec<MatchRecord>>,
    version: AtomicU64,
}

impl BasicRuleEngine {
    pub fn new() -> Self {
        Self {
            table: spin::RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn parse(ruleset: &[u8]) -> Result<Vec<MatchRecord>, RuleEvaluationError> {
        if ruleset.len() % RECORD_LEN != 0 {
            return Err(RuleEvaluationError::Malformed {
                reason: format!(
                    "rule set length {} is not a multiple of {RECORD_LEN}",
                    ruleset.len()
                ),
            });
        }
        let mut records = Vec::with_capacity(ruleset.len() / RECORD_LEN);
        for chunk in ruleset.chunks_exact(RECORD_LEN) {
            let verdict = match chunk[1] {
                0 => Verdict::Allow,
                1 => Verdict::Drop,
                2 => Verdict::Capture,
                other => {
                    return Err(RuleEvaluationError::Malformed {
                        reason: format!("unknown verdict byte {other}"),
                    });
                }
            };
            records.push(MatchRecord {
                proto: chunk[0],
                verdict,
                port: u16::from_le_bytes([chunk[2], chunk[3]]),
            });
        }
        Ok(records)
    }
}

impl Default for BasicRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine for BasicRuleEngine {
    fn evaluate(
        &self,
        meta: &PacketMeta,
        _ruleset_version: u64,
    ) -> Result<Verdict, RuleEvaluationError> {
        let table = self.table.read();
        for record in table.iter() {
            if record.proto != PROTO_ANY && record.proto != meta.proto as u8 {
                continue;
            }
            if record.port != 0
                && record.port != meta.src_port()
                && record.port != meta.dst_port()
            {
                continue;
            }
            return Ok(record.verdict);
        }
        Ok(Verdict::Allow)
    }

    fn load(&self, ruleset: &[u8]) -> Result<u64, RuleEvaluationError> {
        let records = Self::parse(ruleset)?;
        *self.table.write() = records;
        Ok(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
