//! weir: a host-resident network packet filter core.
//!
//! weir sits between network adapters and the upper protocol stack. Each
//! attached adapter gets a filter instance with a pend/complete lifecycle;
//! every packet travelling through an instance is classified by a pluggable
//! rule engine and forwarded, dropped, or forwarded-and-captured. Captured
//! records flow to a privileged user-mode manager over a lock-free ring
//! channel, and the same manager drives rule updates and telemetry queries
//! through a single-session control channel.
//!
//! The crate is host-framework-agnostic: [`pipeline::PacketPipeline`] is
//! the complete dispatch surface (four hook entry points plus the lifecycle
//! operations), and thin adapters such as [`control::server`] translate
//! transport specifics into calls on it.

pub mod control;
pub mod filter;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod ring;
pub mod rules;
pub mod runtime;
