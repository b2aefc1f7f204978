//! # flowdisp-core
//!
//! Core types for the flowdisp protocol work dispatcher.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Workstreams, worker threads and the host topology live in
//! `flowdisp-runtime`.
//!
//! ## Modules
//!
//! - `proto` - Protocol ids, CPU/flow id aliases, affinity and policy
//! - `packet` - The intrusive `Packet` trait and `PacketBuf`
//! - `queue` - Per-(workstream, protocol) FIFO with counters
//! - `flow` - Flow id folding onto workstream indexes
//! - `error` - Error types
//! - `traits` - Host topology trait
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod proto;
pub mod packet;
pub mod queue;
pub mod flow;
pub mod error;
pub mod traits;
pub mod kprint;
pub mod env;

pub use proto::{Affinity, CpuId, FlowId, Policy, ProtoId};
pub use packet::{Packet, PacketBuf};
pub use queue::{Batch, QueueCounters, QueueStats, WorkQueue};
pub use error::{DispatchError, DispatchResult, RegisterError, TopologyError};
pub use traits::Topology;
pub use env::{env_get, env_get_bool, env_get_opt};

/// Table sizes
pub mod constants {
    /// Size of the protocol table; protocol ids are `0..MAX_PROTOS`
    pub const MAX_PROTOS: usize = 16;

    /// Upper bound on workstreams (and therefore worker threads)
    pub const MAX_WORKSTREAMS: usize = 256;
}
