//! # flowdisp-runtime
//!
//! Runtime for the flowdisp protocol work dispatcher.
//!
//! This crate provides:
//! - Configuration (build-time defaults plus `FDP_*` environment overrides)
//! - The protocol registry
//! - Per-CPU workstreams and their worker threads
//! - The dispatch selector and producer entry points
//! - Host topology (Linux affinity, portable fallback, virtual CPUs)
//! - Introspection snapshots

pub mod config;
pub mod dispatch;
pub mod pin;
pub mod registry;
pub mod stats;
pub mod tls;
pub mod topology;

mod select;
mod worker;
mod workstream;

// Re-exports
pub use config::{ConfigError, DispatchConfig};
pub use dispatch::Dispatcher;
pub use pin::CpuPin;
pub use registry::{CpuClassifier, FlowClassifier, FlowHint, Handler, Protocol};
pub use stats::{DispatchStats, ProtocolInfo, QueueReport, WorkstreamStats};
pub use topology::{new_topology, PlatformTopology, VirtualTopology};
