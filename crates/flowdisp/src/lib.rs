//! # flowdisp - Protocol Work Dispatcher
//!
//! Per-CPU work dispatch for protocol input processing.
//!
//! Producers hand units of work (packets) tagged with a protocol id to the
//! dispatcher. For every unit it decides which CPU's worker processes it,
//! then either runs the protocol handler right away on the producer's CPU
//! or queues the unit for that worker.
//!
//! ## Features
//!
//! - **Per-CPU workstreams**: one worker thread and one bounded queue per
//!   protocol on each participating CPU
//! - **Flow ordering**: units of one flow always land on the same worker
//!   and are handled in arrival order
//! - **Direct dispatch**: weakly placed units run inline with no hand-off
//! - **Classifiers**: per protocol, pick a CPU directly or derive a flow id
//! - **Introspection**: per queue length, watermark and drop counters
//!
//! ## Quick Start
//!
//! ```ignore
//! use flowdisp::{FlowHint, PacketBuf, Protocol, Runtime};
//!
//! fn main() {
//!     let mut runtime = Runtime::new(Default::default()).unwrap();
//!
//!     runtime.block_on(|| {
//!         flowdisp::register(
//!             Protocol::new(1, "ip", |pkt: Box<PacketBuf>| {
//!                 println!("{} bytes", pkt.len());
//!             })
//!             .flow_classifier(|pkt| {
//!                 let flow = pkt.flow().unwrap_or(0);
//!                 Some((pkt, FlowHint::new(flow)))
//!             }),
//!         )
//!         .unwrap();
//!
//!         flowdisp::dispatch(1, PacketBuf::with_flow(vec![0u8; 64], 42)).unwrap();
//!         println!("{}", flowdisp::stats());
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Producers                              │
//! │         dispatch(), dispatch_flow(), queue_cpu(), ...       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Registry + Dispatch selector                   │
//! │     classifier -> (cpu, affinity), flow -> cpu folding      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Workstream│      │ Workstream│      │  inline   │
//!    │  cpu 0    │      │  cpu N    │      │  handler  │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use flowdisp_core::{
    Affinity,
    CpuId,
    DispatchError,
    DispatchResult,
    FlowId,
    Packet,
    PacketBuf,
    Policy,
    ProtoId,
    QueueCounters,
    QueueStats,
    RegisterError,
    Topology,
    TopologyError,
};

// Re-export kprint macros for debug logging
pub use flowdisp_core::{kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use flowdisp_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use flowdisp_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use flowdisp_runtime::{
    DispatchConfig,
    DispatchStats,
    Dispatcher,
    FlowHint,
    Protocol,
    ProtocolInfo,
    VirtualTopology,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Process-global dispatcher over [`PacketBuf`]
static DISPATCHER: OnceLock<Dispatcher<PacketBuf>> = OnceLock::new();

fn global() -> &'static Dispatcher<PacketBuf> {
    match DISPATCHER.get() {
        Some(d) => d,
        None => panic!("flowdisp not initialized; call flowdisp::init or Runtime::new first"),
    }
}

/// Create the global dispatcher (primary CPU only until [`start`])
pub fn init(config: DispatchConfig) -> DispatchResult<()> {
    init_logging();
    if DISPATCHER.get().is_some() {
        return Err(DispatchError::AlreadyStarted);
    }
    let dispatcher = Dispatcher::new(config)?;
    DISPATCHER
        .set(dispatcher)
        .map_err(|_| DispatchError::AlreadyStarted)
}

/// Whether [`init`] has run
pub fn is_initialized() -> bool {
    DISPATCHER.get().is_some()
}

/// Bring up the remaining CPUs' workstreams
pub fn start() -> DispatchResult<()> {
    global().start()
}

/// Stop and join the global dispatcher's workers
///
/// The dispatcher itself stays installed; later calls fail with
/// [`DispatchError::Shutdown`].
pub fn shutdown() {
    if let Some(d) = DISPATCHER.get() {
        d.shutdown();
    }
}

pub fn register(proto: Protocol<PacketBuf>) -> Result<(), RegisterError> {
    global().register(proto)
}

pub fn deregister(proto: u8) -> Result<(), RegisterError> {
    global().deregister(proto)
}

pub fn set_queue_limit(proto: u8, limit: usize) -> Result<(), RegisterError> {
    global().set_queue_limit(proto, limit)
}

pub fn queue_drops(proto: u8) -> Result<u64, RegisterError> {
    global().queue_drops(proto)
}

/// Classify and run inline when affinity allows, else queue
#[inline]
pub fn dispatch(proto: u8, pkt: Box<PacketBuf>) -> DispatchResult<()> {
    global().dispatch(proto, pkt)
}

#[inline]
pub fn dispatch_cpu(proto: u8, pkt: Box<PacketBuf>, cpu: CpuId) -> DispatchResult<()> {
    global().dispatch_cpu(proto, pkt, cpu)
}

#[inline]
pub fn dispatch_flow(proto: u8, pkt: Box<PacketBuf>, flow: FlowId) -> DispatchResult<()> {
    global().dispatch_flow(proto, pkt, flow)
}

/// Classify and always queue
#[inline]
pub fn queue(proto: u8, pkt: Box<PacketBuf>) -> DispatchResult<()> {
    global().queue(proto, pkt)
}

#[inline]
pub fn queue_cpu(proto: u8, pkt: Box<PacketBuf>, cpu: CpuId) -> DispatchResult<()> {
    global().queue_cpu(proto, pkt, cpu)
}

#[inline]
pub fn queue_flow(proto: u8, pkt: Box<PacketBuf>, flow: FlowId) -> DispatchResult<()> {
    global().queue_flow(proto, pkt, flow)
}

pub fn cpu_count() -> usize {
    global().cpu_count()
}

pub fn flow_to_cpu(flow: FlowId) -> CpuId {
    global().flow_to_cpu(flow)
}

pub fn stats() -> DispatchStats {
    global().stats()
}

/// Runtime handle for the global dispatcher
///
/// Owns the lifecycle: creating it installs the dispatcher, starting it
/// brings up every workstream, dropping it joins the workers.
pub struct Runtime {
    started: AtomicBool,
}

impl Runtime {
    /// Install the global dispatcher with the given configuration
    ///
    /// Only the primary CPU has a workstream until `start()` or
    /// `block_on()`.
    pub fn new(config: DispatchConfig) -> DispatchResult<Self> {
        init(config)?;
        Ok(Self {
            started: AtomicBool::new(false),
        })
    }

    pub fn start(&mut self) -> DispatchResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }
        start()
    }

    /// Run a function with every workstream up, then shut down
    ///
    /// This is the typical entry point for applications.
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        if let Err(e) = self.start() {
            kwarn!("runtime start: {}", e);
        }
        let result = f();
        self.shutdown();
        result
    }

    pub fn shutdown(&mut self) {
        if self.started.swap(false, Ordering::SeqCst) {
            shutdown();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    // The dispatcher is process-global, so the whole lifecycle lives in
    // one test.
    #[test]
    fn test_global_lifecycle() {
        let config = DispatchConfig::new().max_threads(2).direct_dispatch(false);
        let mut runtime = Runtime::new(config).unwrap();
        assert!(is_initialized());
        assert!(matches!(
            init(DispatchConfig::new()),
            Err(DispatchError::AlreadyStarted)
        ));

        let handled = Arc::new(AtomicUsize::new(0));
        let h = handled.clone();
        let total = runtime.block_on(move || {
            register(
                Protocol::new(2, "echo", move |_pkt: Box<PacketBuf>| {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .flow_classifier(|pkt: Box<PacketBuf>| {
                    let flow = pkt.flow().unwrap_or(0);
                    Some((pkt, FlowHint::new(flow)))
                }),
            )
            .unwrap();
            assert!(cpu_count() >= 1 && cpu_count() <= 2);

            for flow in 0..32 {
                queue(2, PacketBuf::with_flow(vec![0u8; 16], flow)).unwrap();
            }
            dispatch_flow(2, PacketBuf::new(vec![1u8]), 5).unwrap();

            let deadline = Instant::now() + Duration::from_secs(10);
            while handled.load(Ordering::SeqCst) < 33 {
                assert!(Instant::now() < deadline, "timed out");
                std::thread::sleep(Duration::from_millis(1));
            }
            stats().totals(ProtoId::new(2).unwrap()).queued
        });
        assert_eq!(total, 33);
        assert!(matches!(
            queue(2, PacketBuf::new(vec![0u8])),
            Err(DispatchError::Shutdown)
        ));
    }
}
