//! Dispatcher
//!
//! Owns the registry, the workstreams and their worker threads, and exposes
//! the producer entry points.
//!
//! Lock order, outermost first:
//! 1. global registry lock (only when `registry_lock` is enabled)
//! 2. protocol table
//! 3. stream set
//! 4. one workstream's mutex
//!
//! Handlers always run with no lock of levels 2-4 held.

use crate::config::DispatchConfig;
use crate::pin::CpuPin;
use crate::registry::{Classifier, ProtoEntry, Protocol, Registry};
use crate::select::{self, Target};
use crate::stats::{DispatchStats, ProtocolInfo, QueueReport, WorkstreamStats};
use crate::topology;
use crate::worker::WorkerPool;
use crate::workstream::{StreamSet, Workstream};

use flowdisp_core::constants::MAX_PROTOS;
use flowdisp_core::error::{DispatchError, DispatchResult, RegisterError};
use flowdisp_core::kprint::{self, LogLevel};
use flowdisp_core::proto::{CpuId, FlowId, ProtoId};
use flowdisp_core::{kdebug, kinfo, kwarn, Packet, Topology};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// State shared between the dispatcher handle and its worker threads
pub(crate) struct Shared<P: Packet> {
    pub config: DispatchConfig,
    pub topology: Arc<dyn Topology>,
    pub registry: Registry<P>,
    streams: RwLock<StreamSet<P>>,
}

impl<P: Packet> Shared<P> {
    pub fn streams(&self) -> RwLockReadGuard<'_, StreamSet<P>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_mut(&self) -> RwLockWriteGuard<'_, StreamSet<P>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptor of a protocol that producers expect to be registered
    ///
    /// # Panics
    ///
    /// If the protocol is out of range or not registered.
    fn registered(&self, proto: u8) -> Arc<ProtoEntry<P>> {
        match ProtoId::new(proto).and_then(|id| self.registry.lookup(id)) {
            Some(entry) => entry,
            None => panic!("dispatch to unregistered protocol {}", proto),
        }
    }
}

/// Protocol work dispatcher
///
/// Creating a dispatcher brings up the primary CPU's workstream; [`start`]
/// adds the rest. Dropping it stops and joins every worker after they have
/// drained their queues.
///
/// [`start`]: Dispatcher::start
pub struct Dispatcher<P: Packet> {
    shared: Arc<Shared<P>>,
    workers: Mutex<WorkerPool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<P: Packet> Dispatcher<P> {
    /// Create a dispatcher on the platform topology
    pub fn new(config: DispatchConfig) -> DispatchResult<Self> {
        Self::with_topology(config, topology::new_topology())
    }

    /// Create a dispatcher on an explicit topology
    pub fn with_topology(
        config: DispatchConfig,
        topology: Arc<dyn Topology>,
    ) -> DispatchResult<Self> {
        config.validate()?;
        if config.debug_logging && !kprint::level_enabled(LogLevel::Debug) {
            kprint::set_log_level(LogLevel::Debug);
        }

        let dispatcher = Self {
            shared: Arc::new(Shared {
                registry: Registry::new(config.registry_lock),
                streams: RwLock::new(StreamSet::new()),
                config,
                topology,
            }),
            workers: Mutex::new(WorkerPool::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };

        let primary = dispatcher.shared.topology.primary_cpu();
        dispatcher.bring_up(primary)?;
        kdebug!(
            "dispatcher created on {} topology, primary cpu {}",
            dispatcher.shared.topology.name(),
            primary
        );
        Ok(dispatcher)
    }

    /// Add workstreams for the remaining online CPUs, up to `max_threads`
    ///
    /// CPUs beyond the cap stay without a workstream for the dispatcher's
    /// whole life and are reported by [`excluded_cpus`](Self::excluded_cpus).
    pub fn start(&self) -> DispatchResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyStarted);
        }

        let cap = self.shared.config.worker_cap();
        let mut excluded = Vec::new();
        for cpu in self.shared.topology.online_cpus() {
            let (present, count) = {
                let streams = self.shared.streams();
                (streams.get(cpu).is_some(), streams.len())
            };
            if present {
                continue;
            }
            if count >= cap {
                excluded.push(cpu);
                continue;
            }
            self.bring_up(cpu)?;
        }

        if !excluded.is_empty() {
            kinfo!(
                "max_threads {} reached, cpus {:?} get no workstream",
                cap,
                excluded
            );
            self.shared.streams_mut().excluded.extend(excluded);
        }
        kinfo!("dispatcher started with {} workstreams", self.cpu_count());
        Ok(())
    }

    /// Create the workstream for `cpu` and start its worker
    fn bring_up(&self, cpu: CpuId) -> DispatchResult<()> {
        let table = self.shared.registry.read();
        let mut streams = self.shared.streams_mut();

        let mut limits = [0usize; MAX_PROTOS];
        for entry in table.iter().flatten() {
            limits[entry.id.as_usize()] = entry.queue_limit();
        }
        let ws = Arc::new(Workstream::new(cpu, streams.len(), limits));

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(self.shared.clone(), ws.clone())?;
        if self.stopped.load(Ordering::Acquire) {
            // Raced with shutdown, which has already signalled every other
            // workstream.
            ws.request_shutdown();
        }
        streams.push(ws);
        kdebug!("workstream {} up on cpu {}", streams.len() - 1, cpu);
        Ok(())
    }

    /// Stop and join every worker
    ///
    /// Queued units are handled before the workers exit. Later dispatches
    /// fail with [`DispatchError::Shutdown`].
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for ws in self.shared.streams().iter() {
            ws.request_shutdown();
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let n = workers.len();
        workers.join();
        kdebug!("dispatcher shut down, {} workers joined", n);
    }

    // Registration

    /// Install a protocol and size its queue on every workstream
    ///
    /// # Panics
    ///
    /// With `registry_lock` enabled, if called from inside a handler or
    /// classifier the dispatcher is running.
    pub fn register(&self, proto: Protocol<P>) -> Result<(), RegisterError> {
        let id = ProtoId::new(proto.id).ok_or(RegisterError::InvalidProtocol(proto.id))?;
        let classifier = match (proto.cpu_classifier.clone(), proto.flow_classifier.clone()) {
            (Some(_), Some(_)) => return Err(RegisterError::ConflictingClassifiers(proto.id)),
            (Some(f), None) => Classifier::Cpu(f),
            (None, Some(f)) => Classifier::Flow(f),
            (None, None) => Classifier::None,
        };
        let limit = self.effective_limit(proto.queue_limit);

        let _excl = self.shared.registry.exclusive();
        let mut table = self.shared.registry.write();
        if table[id.as_usize()].is_some() {
            return Err(RegisterError::AlreadyRegistered(proto.id));
        }
        let entry = Arc::new(ProtoEntry::new(id, proto, classifier, limit));

        for ws in self.shared.streams().iter() {
            ws.install(id, limit);
        }
        kdebug!(
            "registered protocol {} ({}), policy {}, qlimit {}",
            id,
            entry.name,
            entry.policy(),
            limit
        );
        table[id.as_usize()] = Some(entry);
        Ok(())
    }

    /// Remove a protocol, discarding everything queued for it
    ///
    /// # Panics
    ///
    /// With `registry_lock` enabled, if called from inside a handler or
    /// classifier the dispatcher is running.
    pub fn deregister(&self, proto: u8) -> Result<(), RegisterError> {
        let id = ProtoId::new(proto).ok_or(RegisterError::InvalidProtocol(proto))?;

        let _excl = self.shared.registry.exclusive();
        let mut table = self.shared.registry.write();
        let entry = table[id.as_usize()]
            .take()
            .ok_or(RegisterError::NotRegistered(proto))?;

        let flushed: usize = self.shared.streams().iter().map(|ws| ws.flush(id)).sum();
        kdebug!(
            "deregistered protocol {} ({}), {} queued units discarded",
            id,
            entry.name,
            flushed
        );
        Ok(())
    }

    fn effective_limit(&self, requested: usize) -> usize {
        let config = &self.shared.config;
        if requested == 0 {
            config.default_queue_limit
        } else if requested > config.max_queue_limit {
            kwarn!(
                "queue limit {} above maximum, clamped to {}",
                requested,
                config.max_queue_limit
            );
            config.max_queue_limit
        } else {
            requested
        }
    }

    fn entry(&self, proto: u8) -> Result<Arc<ProtoEntry<P>>, RegisterError> {
        let id = ProtoId::new(proto).ok_or(RegisterError::InvalidProtocol(proto))?;
        self.shared
            .registry
            .lookup(id)
            .ok_or(RegisterError::NotRegistered(proto))
    }

    /// Change a protocol's queue limit on every workstream
    ///
    /// Units already queued beyond a lowered limit stay queued.
    pub fn set_queue_limit(&self, proto: u8, limit: usize) -> Result<(), RegisterError> {
        if limit == 0 || limit > self.shared.config.max_queue_limit {
            return Err(RegisterError::InvalidLimit(limit));
        }
        let entry = self.entry(proto)?;
        entry.set_queue_limit(limit);
        for ws in self.shared.streams().iter() {
            ws.set_limit(entry.id, limit);
        }
        Ok(())
    }

    pub fn queue_limit(&self, proto: u8) -> Result<usize, RegisterError> {
        Ok(self.entry(proto)?.queue_limit())
    }

    /// Drops of a protocol summed across workstreams
    pub fn queue_drops(&self, proto: u8) -> Result<u64, RegisterError> {
        let entry = self.entry(proto)?;
        Ok(self
            .shared
            .streams()
            .iter()
            .map(|ws| ws.lock().queue(entry.id).counters().drops)
            .sum())
    }

    pub fn clear_queue_drops(&self, proto: u8) -> Result<(), RegisterError> {
        let entry = self.entry(proto)?;
        for ws in self.shared.streams().iter() {
            ws.lock().queue(entry.id).clear_drops();
        }
        Ok(())
    }

    /// Registered protocols in id order
    pub fn protocols(&self) -> Vec<ProtocolInfo> {
        self.shared
            .registry
            .entries()
            .iter()
            .map(|e| ProtocolInfo {
                id: e.id,
                name: e.name.clone(),
                policy: e.policy(),
                queue_limit: e.queue_limit(),
            })
            .collect()
    }

    // Producer entry points

    /// Classify the unit and run it inline when affinity allows, else queue it
    pub fn dispatch(&self, proto: u8, unit: Box<P>) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Classify, true)
    }

    /// Like [`dispatch`](Self::dispatch) with an explicit CPU (strong affinity)
    ///
    /// # Panics
    ///
    /// If `cpu` has no workstream.
    pub fn dispatch_cpu(&self, proto: u8, unit: Box<P>, cpu: CpuId) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Cpu(cpu), true)
    }

    /// Like [`dispatch`](Self::dispatch) with an explicit flow id
    pub fn dispatch_flow(&self, proto: u8, unit: Box<P>, flow: FlowId) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Flow(flow), true)
    }

    /// Classify the unit and always queue it
    pub fn queue(&self, proto: u8, unit: Box<P>) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Classify, false)
    }

    /// Queue on an explicit CPU
    ///
    /// # Panics
    ///
    /// If `cpu` has no workstream.
    pub fn queue_cpu(&self, proto: u8, unit: Box<P>, cpu: CpuId) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Cpu(cpu), false)
    }

    /// Queue on the workstream owning `flow`
    pub fn queue_flow(&self, proto: u8, unit: Box<P>, flow: FlowId) -> DispatchResult<()> {
        self.submit(proto, unit, Target::Flow(flow), false)
    }

    fn submit(
        &self,
        proto: u8,
        unit: Box<P>,
        target: Target,
        inline_ok: bool,
    ) -> DispatchResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }
        let shared = &*self.shared;
        let _reg = shared.registry.enter();
        let entry = shared.registered(proto);

        // Only direct dispatch needs the caller to stay put.
        let pin = inline_ok.then(|| CpuPin::new(&*shared.topology));

        let (unit, choice) =
            select::classify(&entry, unit, target, shared.config.default_affinity)?;

        let (target_ws, local_ws) = {
            let streams = shared.streams();
            let target_ws = streams.resolve(choice).clone();
            let local_ws = pin
                .as_ref()
                .and_then(|p| streams.get(p.cpu()).cloned());
            (target_ws, local_ws)
        };

        let Some(pin) = pin else {
            return target_ws.enqueue(entry.id, unit);
        };

        let remote = choice.affinity().is_strong() && target_ws.cpu != pin.cpu();
        if remote || !shared.config.direct_dispatch {
            return target_ws.enqueue(entry.id, unit);
        }

        // Inline: account on the caller's workstream, or on the target's when
        // the caller's CPU has none.
        local_ws.as_ref().unwrap_or(&target_ws).record_inline(entry.id);
        (entry.handler)(unit);
        drop(pin);
        Ok(())
    }

    // Introspection

    /// Number of workstreams
    pub fn cpu_count(&self) -> usize {
        self.shared.streams().len()
    }

    /// CPU of the workstream at `index`, in bring-up order
    pub fn cpu_id(&self, index: usize) -> Option<CpuId> {
        self.shared.streams().by_index(index).map(|ws| ws.cpu)
    }

    /// CPU whose workstream owns `flow`
    pub fn flow_to_cpu(&self, flow: FlowId) -> CpuId {
        self.shared.streams().flow_to_stream(flow).cpu
    }

    /// Online CPUs left without a workstream by `max_threads`
    pub fn excluded_cpus(&self) -> Vec<CpuId> {
        self.shared.streams().excluded.clone()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Snapshot of every workstream and registered protocol
    pub fn stats(&self) -> DispatchStats {
        let shared = &*self.shared;
        let table = shared.registry.read();
        let entries: Vec<&Arc<ProtoEntry<P>>> = table.iter().flatten().collect();
        let streams = shared.streams();

        let workstreams = streams
            .iter()
            .map(|ws| {
                let mut st = ws.lock();
                let queues = entries
                    .iter()
                    .map(|e| QueueReport {
                        proto: e.id,
                        name: e.name.clone(),
                        stats: st.queue(e.id).stats(),
                    })
                    .collect();
                WorkstreamStats {
                    index: ws.index,
                    cpu: ws.cpu,
                    pending: st.pending,
                    running: st.running,
                    signaled: st.signaled,
                    queues,
                }
            })
            .collect();

        DispatchStats {
            topology: shared.topology.name(),
            direct_dispatch: shared.config.direct_dispatch,
            max_threads: shared.config.max_threads,
            default_queue_limit: shared.config.default_queue_limit,
            max_queue_limit: shared.config.max_queue_limit,
            protocols: entries
                .iter()
                .map(|e| ProtocolInfo {
                    id: e.id,
                    name: e.name.clone(),
                    policy: e.policy(),
                    queue_limit: e.queue_limit(),
                })
                .collect(),
            workstreams,
            excluded_cpus: streams.excluded.clone(),
        }
    }
}

impl<P: Packet> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FlowHint;
    use crate::topology::VirtualTopology;
    use flowdisp_core::proto::Affinity;

    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct TestPacket {
        seq: u32,
        flow: FlowId,
        drops: Arc<AtomicUsize>,
        next: Option<Box<TestPacket>>,
    }

    impl Packet for TestPacket {
        fn next_slot(&mut self) -> &mut Option<Box<Self>> {
            &mut self.next
        }
    }

    impl Drop for TestPacket {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn packet(seq: u32, flow: FlowId, drops: &Arc<AtomicUsize>) -> Box<TestPacket> {
        Box::new(TestPacket {
            seq,
            flow,
            drops: drops.clone(),
            next: None,
        })
    }

    fn dispatcher(cpus: usize, config: DispatchConfig) -> Dispatcher<TestPacket> {
        let topo = Arc::new(VirtualTopology::new(cpus));
        let d = Dispatcher::with_topology(config, topo).unwrap();
        d.start().unwrap();
        d
    }

    fn flow_proto(
        id: u8,
        limit: usize,
        seen: Arc<Mutex<Vec<(CpuId, u32)>>>,
    ) -> Protocol<TestPacket> {
        Protocol::new(id, format!("p{}", id), move |pkt: Box<TestPacket>| {
            let cpu = crate::tls::current_cpu().unwrap_or(usize::MAX);
            seen.lock().unwrap().push((cpu, pkt.seq));
        })
        .flow_classifier(|pkt: Box<TestPacket>| {
            let flow = pkt.flow;
            Some((pkt, FlowHint::new(flow)))
        })
        .queue_limit(limit)
    }

    fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_brings_up_online_cpus() {
        let d = dispatcher(4, DispatchConfig::new());
        assert!(d.is_started());
        assert_eq!(d.cpu_count(), 4);
        assert_eq!(d.cpu_id(0), Some(0));
        assert_eq!(d.cpu_id(3), Some(3));
        assert_eq!(d.cpu_id(4), None);
        assert!(d.excluded_cpus().is_empty());
        assert_eq!(d.start(), Err(DispatchError::AlreadyStarted));
    }

    #[test]
    fn test_max_threads_excludes_cpus() {
        let d = dispatcher(6, DispatchConfig::new().max_threads(2));
        assert_eq!(d.cpu_count(), 2);
        assert_eq!(d.excluded_cpus(), vec![2, 3, 4, 5]);
        assert_eq!(d.stats().excluded_cpus, vec![2, 3, 4, 5]);

        let d = dispatcher(6, DispatchConfig::new().max_threads(0));
        assert_eq!(d.cpu_count(), 1);
    }

    #[test]
    fn test_primary_only_before_start() {
        let topo = Arc::new(VirtualTopology::with_cpus(vec![2, 5]));
        let d: Dispatcher<TestPacket> =
            Dispatcher::with_topology(DispatchConfig::new(), topo).unwrap();
        assert_eq!(d.cpu_count(), 1);
        assert_eq!(d.cpu_id(0), Some(2));
        assert_eq!(d.flow_to_cpu(0xDEAD_BEEF), 2);
    }

    #[test]
    fn test_bind_threads() {
        let topo = Arc::new(VirtualTopology::new(3));
        let d: Dispatcher<TestPacket> = Dispatcher::with_topology(
            DispatchConfig::new().bind_threads(true),
            topo.clone(),
        )
        .unwrap();
        d.start().unwrap();
        wait_until("workers bound", || topo.bound_cpus().len() == 3);
        let mut bound = topo.bound_cpus();
        bound.sort();
        assert_eq!(bound, vec![0, 1, 2]);
    }

    #[test]
    fn test_register_errors() {
        let d = dispatcher(2, DispatchConfig::new());
        let noop = |_p: Box<TestPacket>| {};

        assert_eq!(
            d.register(Protocol::new(MAX_PROTOS as u8, "big", noop)),
            Err(RegisterError::InvalidProtocol(MAX_PROTOS as u8))
        );
        assert_eq!(
            d.register(
                Protocol::new(3, "both", noop)
                    .cpu_classifier(|p: Box<TestPacket>| Some((p, 0, Affinity::Weak)))
                    .flow_classifier(|p: Box<TestPacket>| Some((p, FlowHint::new(0))))
            ),
            Err(RegisterError::ConflictingClassifiers(3))
        );
        assert!(d.register(Protocol::new(3, "ok", noop)).is_ok());
        assert_eq!(
            d.register(Protocol::new(3, "again", noop)),
            Err(RegisterError::AlreadyRegistered(3))
        );
        assert_eq!(d.deregister(4), Err(RegisterError::NotRegistered(4)));
        assert!(d.deregister(3).is_ok());
        assert_eq!(d.deregister(3), Err(RegisterError::NotRegistered(3)));
    }

    #[test]
    fn test_queue_limits() {
        let config = DispatchConfig::new()
            .default_queue_limit(64)
            .max_queue_limit(128);
        let d = dispatcher(2, config);
        let noop = |_p: Box<TestPacket>| {};

        d.register(Protocol::new(1, "dflt", noop)).unwrap();
        d.register(Protocol::new(2, "huge", noop).queue_limit(1000))
            .unwrap();
        assert_eq!(d.queue_limit(1), Ok(64));
        assert_eq!(d.queue_limit(2), Ok(128));

        assert_eq!(d.set_queue_limit(1, 0), Err(RegisterError::InvalidLimit(0)));
        assert_eq!(d.set_queue_limit(1, 129), Err(RegisterError::InvalidLimit(129)));
        assert_eq!(d.set_queue_limit(5, 10), Err(RegisterError::NotRegistered(5)));
        d.set_queue_limit(1, 10).unwrap();
        assert_eq!(d.queue_limit(1), Ok(10));

        let stats = d.stats();
        for ws in &stats.workstreams {
            assert_eq!(ws.queues[0].stats.limit, 10);
            assert_eq!(ws.queues[1].stats.limit, 128);
        }
        let names: Vec<String> = d.protocols().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["dflt", "huge"]);
    }

    #[test]
    fn test_flow_stickiness_and_order() {
        let d = dispatcher(4, DispatchConfig::new().direct_dispatch(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(2, 1024, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        let flow = 0x0102_0304;
        for seq in 0..200 {
            d.dispatch(2, packet(seq, flow, &drops)).unwrap();
        }
        wait_until("all handled", || seen.lock().unwrap().len() == 200);

        let expected = d.flow_to_cpu(flow);
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|&(cpu, _)| cpu == expected));
        let seqs: Vec<u32> = seen.iter().map(|&(_, s)| s).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_direct_dispatch_weak_runs_inline() {
        let d = dispatcher(4, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(1, 16, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        // The flow maps to some other CPU; weak affinity still runs here.
        VirtualTopology::set_current_cpu(3);
        let flow = 1;
        assert_ne!(d.flow_to_cpu(flow), 3);
        d.dispatch(1, packet(7, flow, &drops)).unwrap();
        VirtualTopology::clear_current_cpu();

        // Inline: ran on this (non-worker) thread before dispatch returned.
        assert_eq!(seen.lock().unwrap().as_slice(), &[(usize::MAX, 7)]);
        let q = *d.stats().queue(3, ProtoId::new(1).unwrap()).unwrap();
        assert_eq!(q.counters.dispatched, 1);
        assert_eq!(q.counters.handled, 1);
        assert_eq!(q.counters.queued, 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strong_affinity_remote_is_queued() {
        let d = dispatcher(4, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(1, 16, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        VirtualTopology::set_current_cpu(0);
        d.dispatch_cpu(1, packet(1, 0, &drops), 2).unwrap();
        // Strong and local: inline.
        d.dispatch_cpu(1, packet(2, 0, &drops), 0).unwrap();
        VirtualTopology::clear_current_cpu();

        wait_until("remote unit handled", || seen.lock().unwrap().len() == 2);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(2, 1)));
        assert!(seen.contains(&(usize::MAX, 2)));

        let stats = d.stats();
        let p = ProtoId::new(1).unwrap();
        assert_eq!(stats.queue(2, p).unwrap().counters.queued, 1);
        assert_eq!(stats.queue(0, p).unwrap().counters.dispatched, 1);
    }

    #[test]
    fn test_default_affinity_strong_queues_flow() {
        let d = dispatcher(
            4,
            DispatchConfig::new().default_affinity(Affinity::Strong),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(1, 16, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        let flow = 1;
        let target = d.flow_to_cpu(flow);
        VirtualTopology::set_current_cpu(if target == 0 { 1 } else { 0 });
        d.dispatch_flow(1, packet(5, 0, &drops), flow).unwrap();
        VirtualTopology::clear_current_cpu();

        wait_until("queued unit handled", || seen.lock().unwrap().len() == 1);
        assert_eq!(seen.lock().unwrap()[0], (target, 5));
    }

    #[test]
    fn test_direct_dispatch_off_queues_everything() {
        let d = dispatcher(2, DispatchConfig::new().direct_dispatch(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(4, 256, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        for seq in 0..50 {
            d.dispatch(4, packet(seq, seq, &drops)).unwrap();
        }
        wait_until("all handled", || seen.lock().unwrap().len() == 50);

        let totals = d.stats().totals(ProtoId::new(4).unwrap());
        assert_eq!(totals.dispatched, 0);
        assert_eq!(totals.queued, 50);
        wait_until("counters settle", || {
            d.stats().totals(ProtoId::new(4).unwrap()).handled == 50
        });
        assert_eq!(drops.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_no_classifier_uses_protocol_id() {
        let d = dispatcher(4, DispatchConfig::new());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        d.register(Protocol::new(6, "src", move |pkt: Box<TestPacket>| {
            let cpu = crate::tls::current_cpu();
            let _ = tx.lock().unwrap().send((cpu, pkt.seq));
        }))
        .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        d.queue(6, packet(9, 0, &drops)).unwrap();
        let (cpu, seq) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(cpu, Some(d.flow_to_cpu(6)));
    }

    #[test]
    fn test_classifier_consuming_unit() {
        let d = dispatcher(2, DispatchConfig::new());
        d.register(
            Protocol::new(1, "eat", |_p: Box<TestPacket>| {})
                .cpu_classifier(|_p: Box<TestPacket>| None),
        )
        .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            d.dispatch(1, packet(0, 0, &drops)),
            Err(DispatchError::NoResources)
        );
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cpu_classifier_without_workstream_is_folded() {
        let d = dispatcher(2, DispatchConfig::new());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        d.register(
            Protocol::new(1, "cpu", move |_p: Box<TestPacket>| {
                let _ = tx.lock().unwrap().send(crate::tls::current_cpu());
            })
            .cpu_classifier(|p: Box<TestPacket>| Some((p, 9, Affinity::Strong))),
        )
        .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        d.queue(1, packet(0, 0, &drops)).unwrap();
        let cpu = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(cpu, Some(d.flow_to_cpu(9)));
    }

    #[test]
    #[should_panic(expected = "unregistered protocol")]
    fn test_unregistered_protocol_panics() {
        let d = dispatcher(1, DispatchConfig::new());
        let drops = Arc::new(AtomicUsize::new(0));
        let _ = d.dispatch(3, packet(0, 0, &drops));
    }

    #[test]
    #[should_panic(expected = "no workstream")]
    fn test_explicit_cpu_without_workstream_panics() {
        let d = dispatcher(2, DispatchConfig::new());
        d.register(Protocol::new(1, "p", |_p: Box<TestPacket>| {}))
            .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let _ = d.queue_cpu(1, packet(0, 0, &drops), 7);
    }

    /// Register a protocol whose handler parks the worker of `cpu` until
    /// released, and wait until it is parked.
    fn plug(
        d: &Dispatcher<TestPacket>,
        id: u8,
        cpu: CpuId,
        drops: &Arc<AtomicUsize>,
    ) -> mpsc::Sender<()> {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        d.register(Protocol::new(id, "plug", move |_p: Box<TestPacket>| {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        }))
        .unwrap();
        d.queue_cpu(id, packet(0, 0, drops), cpu).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        release_tx
    }

    #[test]
    fn test_full_queue_scenario() {
        let d = dispatcher(4, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));

        let flow = 0xAABB_CCDD;
        let target = d.flow_to_cpu(flow);
        let release = plug(&d, 0, target, &drops);
        d.register(flow_proto(7, 4, seen.clone())).unwrap();

        for seq in 0..4 {
            d.queue(7, packet(seq, flow, &drops)).unwrap();
        }
        let before = drops.load(Ordering::SeqCst);
        assert_eq!(
            d.queue(7, packet(4, flow, &drops)),
            Err(DispatchError::NoBufferSpace)
        );
        assert_eq!(drops.load(Ordering::SeqCst), before + 1);

        let p = ProtoId::new(7).unwrap();
        let q = *d.stats().queue(target, p).unwrap();
        assert_eq!(q.len, 4);
        assert_eq!(q.watermark, 4);
        assert_eq!(q.counters.drops, 1);
        assert_eq!(d.queue_drops(7), Ok(1));

        release.send(()).unwrap();
        wait_until("queue drained", || {
            d.stats().queue(target, p).unwrap().counters.handled == 4
        });

        let q = *d.stats().queue(target, p).unwrap();
        assert_eq!(q.len, 0);
        assert_eq!(q.counters.queued, 4);
        assert_eq!(q.counters.drops, 1);
        let seqs: Vec<u32> = seen.lock().unwrap().iter().map(|&(_, s)| s).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);

        d.clear_queue_drops(7).unwrap();
        assert_eq!(d.queue_drops(7), Ok(0));
    }

    #[test]
    fn test_deregister_discards_queued() {
        let d = dispatcher(2, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));

        let release = plug(&d, 0, 1, &drops);
        d.register(flow_proto(3, 16, seen.clone())).unwrap();
        for seq in 0..5 {
            d.queue_cpu(3, packet(seq, 0, &drops), 1).unwrap();
        }
        let before = drops.load(Ordering::SeqCst);
        d.deregister(3).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), before + 5);
        assert_eq!(d.stats().workstream(1).unwrap().pending, 0);

        d.register(flow_proto(3, 16, seen.clone())).unwrap();
        let q = *d.stats().queue(1, ProtoId::new(3).unwrap()).unwrap();
        assert_eq!(q.len, 0);
        assert_eq!(q.counters, Default::default());

        release.send(()).unwrap();
        drop(d);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_deregister_discards_queued_on_every_workstream() {
        let d = dispatcher(3, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));

        let releases: Vec<mpsc::Sender<()>> = (0..3u8)
            .map(|cpu| plug(&d, cpu, cpu as CpuId, &drops))
            .collect();
        d.register(flow_proto(5, 16, seen.clone())).unwrap();
        for cpu in 0..3 {
            for seq in 0..4 {
                d.queue_cpu(5, packet(seq, 0, &drops), cpu).unwrap();
            }
        }
        assert_eq!(d.stats().pending(), 12);

        let before = drops.load(Ordering::SeqCst);
        d.deregister(5).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), before + 12);

        d.register(flow_proto(5, 16, seen.clone())).unwrap();
        let stats = d.stats();
        let p = ProtoId::new(5).unwrap();
        for ws in &stats.workstreams {
            assert_eq!(ws.pending, 0);
            let q = stats.queue(ws.cpu, p).unwrap();
            assert_eq!(q.len, 0);
            assert_eq!(q.counters, Default::default());
        }

        for release in &releases {
            release.send(()).unwrap();
        }
        drop(d);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_registry_lock_deregister_waits_for_batch() {
        let d = Arc::new(dispatcher(
            2,
            DispatchConfig::new().registry_lock(true),
        ));
        let drops = Arc::new(AtomicUsize::new(0));

        let (entered_tx, entered_rx) = mpsc::channel::<u32>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        d.register(Protocol::new(3, "old", move |p: Box<TestPacket>| {
            let _ = entered_tx.lock().unwrap().send(p.seq);
            let _ = release_rx.lock().unwrap().recv();
        }))
        .unwrap();

        for seq in 0..3 {
            d.queue_cpu(3, packet(seq, 0, &drops), 1).unwrap();
        }
        // Worker 1 is inside the old handler with its batch detached.
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(10)).unwrap(), 0);

        let new_handled = Arc::new(AtomicUsize::new(0));
        let swap = {
            let d = d.clone();
            let n = new_handled.clone();
            std::thread::spawn(move || {
                d.deregister(3).unwrap();
                d.register(Protocol::new(3, "new", move |_p: Box<TestPacket>| {
                    n.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!swap.is_finished());

        drop(release_tx);
        swap.join().unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(new_handled.load(Ordering::SeqCst), 0);
        let q = *d.stats().queue(1, ProtoId::new(3).unwrap()).unwrap();
        assert_eq!(q.len, 0);
        assert_eq!(q.counters, Default::default());
    }

    #[test]
    #[should_panic(expected = "registry_lock")]
    fn test_register_from_handler_with_registry_lock_panics() {
        let d = Arc::new(dispatcher(1, DispatchConfig::new().registry_lock(true)));
        let inner = Arc::downgrade(&d);
        d.register(Protocol::new(1, "reg", move |_p: Box<TestPacket>| {
            if let Some(d) = inner.upgrade() {
                let _ = d.register(Protocol::new(2, "late", |_p: Box<TestPacket>| {}));
            }
        }))
        .unwrap();

        // Single CPU, weak affinity: the handler runs inline on this thread.
        let drops = Arc::new(AtomicUsize::new(0));
        let _ = d.dispatch(1, packet(0, 0, &drops));
    }

    #[test]
    fn test_handler_panic_keeps_worker() {
        let d = dispatcher(2, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        d.register(Protocol::new(1, "fragile", move |p: Box<TestPacket>| {
            if p.seq == 0 {
                panic!("bad unit");
            }
            sink.lock().unwrap().push(p.seq);
        }))
        .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let p = ProtoId::new(1).unwrap();

        d.queue_cpu(1, packet(0, 0, &drops), 1).unwrap();
        wait_until("failed batch accounted", || {
            d.stats().queue(1, p).unwrap().counters.handled == 1
        });

        for seq in 1..4 {
            d.queue_cpu(1, packet(seq, 0, &drops), 1).unwrap();
        }
        wait_until("later units handled", || seen.lock().unwrap().len() == 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        wait_until("every unit disposed", || drops.load(Ordering::SeqCst) == 4);
    }

    #[test]
    fn test_concurrent_producers_keep_order() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 500;

        let d = dispatcher(2, DispatchConfig::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        d.register(
            Protocol::new(1, "mp", move |p: Box<TestPacket>| {
                sink.lock().unwrap().push((p.flow, p.seq));
            })
            .queue_limit(4096),
        )
        .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        // Every producer feeds the same worker.
        std::thread::scope(|s| {
            for producer in 0..PRODUCERS {
                let d = &d;
                let drops = &drops;
                s.spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        d.queue_cpu(1, packet(seq, producer, drops), 1).unwrap();
                    }
                });
            }
        });

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        wait_until("all handled", || seen.lock().unwrap().len() == total);
        {
            let seen = seen.lock().unwrap();
            for producer in 0..PRODUCERS {
                let seqs: Vec<u32> = seen
                    .iter()
                    .filter(|&&(flow, _)| flow == producer)
                    .map(|&(_, seq)| seq)
                    .collect();
                assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
            }
        }

        let p = ProtoId::new(1).unwrap();
        wait_until("counters settle", || {
            d.stats().queue(1, p).unwrap().counters.handled == total as u64
        });
        let q = *d.stats().queue(1, p).unwrap();
        assert_eq!(q.counters.queued, total as u64);
        assert_eq!(q.counters.drops, 0);
        assert_eq!(d.stats().workstream(1).unwrap().pending, 0);
    }

    #[test]
    fn test_registry_lock_reentrant_dispatch() {
        let d = Arc::new(dispatcher(
            2,
            DispatchConfig::new().registry_lock(true),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(2, 16, seen.clone())).unwrap();

        // Protocol 1 re-dispatches into protocol 2 from inside its handler.
        let inner = Arc::downgrade(&d);
        d.register(Protocol::new(1, "outer", move |mut p: Box<TestPacket>| {
            if let Some(d) = inner.upgrade() {
                p.seq += 100;
                let _ = d.dispatch(2, p);
            }
        }))
        .unwrap();

        let drops = Arc::new(AtomicUsize::new(0));
        d.dispatch(1, packet(1, 0, &drops)).unwrap();
        d.queue(1, packet(2, 0, &drops)).unwrap();
        wait_until("both forwarded", || seen.lock().unwrap().len() == 2);
        d.deregister(1).unwrap();
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let d = dispatcher(2, DispatchConfig::new().direct_dispatch(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.register(flow_proto(1, 1024, seen.clone())).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        for seq in 0..100 {
            d.queue(1, packet(seq, seq, &drops)).unwrap();
        }
        d.shutdown();
        assert_eq!(seen.lock().unwrap().len(), 100);
        assert_eq!(
            d.queue(1, packet(0, 0, &drops)),
            Err(DispatchError::Shutdown)
        );
        assert_eq!(d.start(), Err(DispatchError::Shutdown));
    }
}
