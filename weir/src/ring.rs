//! Lock-free ring channel between the filter core and the control session.
//!
//! A single fixed-capacity byte arena, capacity a power of two, with
//! monotonically advancing head/tail counters. The writer side lives on the
//! packet path and never blocks: a write that does not fit fails whole. The
//! reader side belongs to the control session and may suspend waiting for
//! data at a cooperative point.
//!
//! The single-writer/single-reader discipline is enforced by the type
//! system: [`RingBuffer::split`] yields exactly one [`RingProducer`] and one
//! [`RingConsumer`], and neither is `Clone`. No lock is shared between the
//! two sides; each publishes its counter with release ordering and observes
//! the other's with acquire ordering.

mod buffer;

pub use buffer::{
    RingBuffer, RingCancelToken, RingConsumer, RingError, RingProducer, DEFAULT_CAPACITY,
};
