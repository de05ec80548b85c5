//! One attached adapter: lifecycle state machine plus outstanding-packet
//! counters.
//!
//! Packets handed to asynchronous layers may be held for an unbounded time.
//! The pending counters and the deferred pause transition are the only
//! synchronization between the lifecycle machine and the packet path: state
//! never tears down while a counter is nonzero, and whichever completion
//! observes the zero crossing while the instance is `Pausing` finishes the
//! pause exactly once.

use std::{
    fmt,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use tokio::sync::Notify;
use tracing::warn;
use weir_common::Direction;

use crate::filter::error::FilterError;

/// Registry identifier of an attached instance. The data path refers to
/// instances only through this id, never through a stored reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Attaching = 0,
    Paused = 1,
    Running = 2,
    Pausing = 3,
    Detaching = 4,
    Detached = 5,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Attaching,
            1 => LifecycleState::Paused,
            2 => LifecycleState::Running,
            3 => LifecycleState::Pausing,
            4 => LifecycleState::Detaching,
            _ => LifecycleState::Detached,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Attaching => "attaching",
            LifecycleState::Paused => "paused",
            LifecycleState::Running => "running",
            LifecycleState::Pausing => "pausing",
            LifecycleState::Detaching => "detaching",
            LifecycleState::Detached => "detached",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a pause request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseStatus {
    /// Both counters were already zero; the instance is paused now.
    Paused,
    /// Packets are outstanding; the transition completes asynchronously
    /// when the last completion drains the counters.
    Draining,
}

pub struct FilterInstance {
    id: InstanceId,
    adapter: String,
    state: AtomicU8,
    pending_send: AtomicU64,
    pending_recv: AtomicU64,
    ruleset_version: AtomicU64,
    pause_done: Notify,
}

impl FilterInstance {
    pub(crate) fn new(id: InstanceId, adapter: String, ruleset_version: u64) -> Self {
        Self {
            id,
            adapter,
            state: AtomicU8::new(LifecycleState::Attaching as u8),
            pending_send: AtomicU64::new(0),
            pending_recv: AtomicU64::new(0),
            ruleset_version: AtomicU64::new(ruleset_version),
            pause_done: Notify::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[inline]
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn pending_send(&self) -> u64 {
        self.pending_send.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pending_recv(&self) -> u64 {
        self.pending_recv.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ruleset_version(&self) -> u64 {
        self.ruleset_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_ruleset_version(&self, version: u64) {
        self.ruleset_version.store(version, Ordering::Release);
    }

    #[inline]
    fn pending(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Egress => &self.pending_send,
            Direction::Ingress => &self.pending_recv,
        }
    }

    fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        attempted: &'static str,
    ) -> Result<(), FilterError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| FilterError::State {
                id: self.id,
                from: LifecycleState::from_u8(actual),
                attempted,
            })
    }

    /// `Attaching -> Paused`, called once registration succeeded.
    pub(crate) fn complete_attach(&self) -> Result<(), FilterError> {
        self.transition(LifecycleState::Attaching, LifecycleState::Paused, "attach")
    }

    /// `Paused -> Running`: begin accepting packets.
    pub(crate) fn restart(&self) -> Result<(), FilterError> {
        self.transition(LifecycleState::Paused, LifecycleState::Running, "restart")
    }

    /// `Running -> Pausing`, then `-> Paused` immediately if nothing is
    /// outstanding. Acceptance of new packets stops the moment the CAS to
    /// `Pausing` lands.
    pub(crate) fn request_pause(&self) -> Result<PauseStatus, FilterError> {
        self.transition(LifecycleState::Running, LifecycleState::Pausing, "pause")?;
        if self.try_complete_pause() {
            return Ok(PauseStatus::Paused);
        }
        Ok(PauseStatus::Draining)
    }

    /// `Paused -> Detaching -> Detached`. Rejected while packets may still
    /// reference this instance (`Running`/`Pausing`).
    pub(crate) fn detach(&self) -> Result<(), FilterError> {
        self.transition(LifecycleState::Paused, LifecycleState::Detaching, "detach")?;
        // Nothing can intervene between Detaching and Detached; the split
        // exists so enumeration observes a tearing-down instance distinctly.
        self.transition(LifecycleState::Detaching, LifecycleState::Detached, "detach")
    }

    /// Count one accepted packet.
    #[inline]
    pub(crate) fn packet_accepted(&self, direction: Direction) {
        self.pending(direction).fetch_add(1, Ordering::AcqRel);
    }

    /// Count one completed (or immediately dropped) packet, and finish a
    /// deferred pause if this was the zero crossing.
    pub(crate) fn packet_completed(&self, direction: Direction) {
        let counter = self.pending(direction);
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_err()
        {
            // Completion without a matching accept is a host-framework
            // contract violation; reject it instead of wrapping the counter.
            warn!(
                event.name = "instance.completion_underflow",
                instance.id = %self.id,
                adapter = %self.adapter,
                direction = direction.as_str(),
                "completion arrived for a packet that was never counted"
            );
            return;
        }
        self.try_complete_pause();
    }

    /// CAS `Pausing -> Paused` when both counters read zero. The winning
    /// caller fires the pause signal; every other observer of the same zero
    /// crossing loses the CAS and does nothing.
    fn try_complete_pause(&self) -> bool {
        if self.state.load(Ordering::Acquire) != LifecycleState::Pausing as u8 {
            return false;
        }
        if self.pending_send.load(Ordering::Acquire) != 0
            || self.pending_recv.load(Ordering::Acquire) != 0
        {
            return false;
        }
        let won = self
            .state
            .compare_exchange(
                LifecycleState::Pausing as u8,
                LifecycleState::Paused as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.pause_done.notify_waiters();
        }
        won
    }

    /// Await the completion of a pause requested earlier. Control context
    /// only; returns immediately when the instance is already paused.
    pub(crate) async fn wait_paused(&self) {
        loop {
            let notified = self.pause_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == LifecycleState::Paused {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for FilterInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterInstance")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .field("state", &self.state())
            .field("pending_send", &self.pending_send())
            .field("pending_recv", &self.pending_recv())
            .field("ruleset_version", &self.ruleset_version())
            .finish()
    }
}
