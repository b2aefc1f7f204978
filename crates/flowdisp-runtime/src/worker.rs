//! Worker thread management
//!
//! Each workstream has exactly one worker thread. The worker sleeps on the
//! workstream's condvar while nothing is pending, and otherwise drains the
//! protocol queues in id order: the whole list of a queue is detached under
//! the lock and handed to the protocol's handler with the lock released.

use crate::dispatch::Shared;
use crate::registry::ProtoEntry;
use crate::tls;
use crate::workstream::Workstream;

use flowdisp_core::error::TopologyError;
use flowdisp_core::proto::{CpuId, ProtoId};
use flowdisp_core::queue::Batch;
use flowdisp_core::{kdebug, kerror, kprint, kwarn, Packet};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pool of worker threads, one per workstream
pub(crate) struct WorkerPool {
    /// Join handles with the CPU each worker serves
    handles: Vec<(CpuId, JoinHandle<()>)>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Start the worker for `ws`
    pub fn spawn<P: Packet>(
        &mut self,
        shared: Arc<Shared<P>>,
        ws: Arc<Workstream<P>>,
    ) -> Result<(), TopologyError> {
        let cpu = ws.cpu;
        let handle = thread::Builder::new()
            .name(format!("fdp-swi-{}", cpu))
            .spawn(move || worker_thread(shared, ws))
            .map_err(|_| TopologyError::SpawnFailed)?;
        self.handles.push((cpu, handle));
        Ok(())
    }

    /// Wait for every worker to exit
    ///
    /// Workers must already have been asked to shut down.
    pub fn join(&mut self) {
        for (cpu, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                kwarn!("worker for cpu {} panicked", cpu);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

fn worker_thread<P: Packet>(shared: Arc<Shared<P>>, ws: Arc<Workstream<P>>) {
    let cpu = ws.cpu;
    tls::set_worker_cpu(cpu);
    kprint::set_thread_cpu(cpu);

    if shared.config.bind_threads {
        if let Err(e) = shared.topology.bind_thread(cpu) {
            kwarn!("cannot bind worker to cpu {}: {}", cpu, e);
        }
    }

    kdebug!("worker {} started", ws.index);
    worker_main_loop(&shared, &ws);
    kdebug!("worker {} exiting", ws.index);

    kprint::clear_thread_cpu();
    tls::clear_worker_cpu();
}

/// Drain loop; returns once shutdown is requested and nothing is pending
///
/// The registry lock and the protocol table rank above the workstream
/// lock, so the worker takes them before relocking to detach a batch and
/// keeps the registry hold until the batch is accounted for. With
/// `registry_lock` enabled a deregistration therefore either flushes the
/// units or waits until they are handled and counted.
fn worker_main_loop<P: Packet>(shared: &Shared<P>, ws: &Workstream<P>) {
    let mut st = ws.lock();
    loop {
        st = match ws.wait_for_work(st) {
            Some(st) => st,
            None => return,
        };

        for proto in ProtoId::all() {
            if st.queue(proto).is_empty() {
                continue;
            }
            drop(st);
            let reg = shared.registry.enter();
            let entry = shared.registry.lookup(proto);

            st = ws.lock();
            let batch = st.queue(proto).detach();
            let n = batch.len();
            if n == 0 {
                // Flushed by a deregistration in between
                continue;
            }
            st.pending -= n;
            drop(st);

            let handled = match entry {
                Some(entry) => {
                    run_batch(&entry, batch);
                    true
                }
                // Deregistered after the units were queued
                None => {
                    drop(batch);
                    false
                }
            };

            st = ws.lock();
            if handled {
                st.queue(proto).record_handled(n);
            }
            drop(reg);
        }
    }
}

/// Hand a batch to its handler; a panicking handler loses the rest of the
/// batch but not the worker
fn run_batch<P: Packet>(entry: &ProtoEntry<P>, batch: Batch<P>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| entry.handle_all(batch)));
    if result.is_err() {
        kerror!(
            "handler of protocol {} ({}) panicked, rest of batch discarded",
            entry.id,
            entry.name
        );
    }
}
