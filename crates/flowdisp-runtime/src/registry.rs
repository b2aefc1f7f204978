//! Protocol registry
//!
//! A fixed table of `MAX_PROTOS` slots, each empty or holding the descriptor
//! of one registered protocol. Descriptors are shared through `Arc`, so a
//! dispatch that looked one up keeps it alive even if the protocol is
//! deregistered underneath it.
//!
//! The optional global lock (`registry_lock`) is separate from the table
//! lock: when enabled, dispatches and worker batches hold it shared for
//! their whole duration and registration changes take it exclusive, so no
//! handler of a protocol being removed can still be running afterwards.

use crate::tls::{self, LockEntry};

use flowdisp_core::constants::MAX_PROTOS;
use flowdisp_core::proto::{Affinity, CpuId, FlowId, Policy, ProtoId};
use flowdisp_core::Packet;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Protocol handler; receives ownership of each unit
pub type Handler<P> = Arc<dyn Fn(Box<P>) + Send + Sync>;

/// Picks a flow for a unit; `None` means the unit was consumed
pub type FlowClassifier<P> = Arc<dyn Fn(Box<P>) -> Option<(Box<P>, FlowHint)> + Send + Sync>;

/// Picks a CPU and affinity for a unit; `None` means the unit was consumed
pub type CpuClassifier<P> =
    Arc<dyn Fn(Box<P>) -> Option<(Box<P>, CpuId, Affinity)> + Send + Sync>;

/// Result of flow classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHint {
    pub flow: FlowId,
    /// `None` uses the dispatcher's default affinity
    pub affinity: Option<Affinity>,
}

impl FlowHint {
    pub fn new(flow: FlowId) -> Self {
        Self {
            flow,
            affinity: None,
        }
    }

    pub fn with_affinity(flow: FlowId, affinity: Affinity) -> Self {
        Self {
            flow,
            affinity: Some(affinity),
        }
    }
}

pub(crate) enum Classifier<P: Packet> {
    Cpu(CpuClassifier<P>),
    Flow(FlowClassifier<P>),
    None,
}

/// Registration request, built with chained setters
///
/// ```rust,ignore
/// let ip = Protocol::new(1, "ip", |pkt: Box<PacketBuf>| ip_input(pkt))
///     .flow_classifier(|pkt| {
///         let flow = pkt.flow()?;
///         Some((pkt, FlowHint::new(flow)))
///     })
///     .queue_limit(1024);
/// dispatcher.register(ip)?;
/// ```
pub struct Protocol<P: Packet> {
    pub(crate) id: u8,
    pub(crate) name: String,
    pub(crate) handler: Handler<P>,
    pub(crate) flow_classifier: Option<FlowClassifier<P>>,
    pub(crate) cpu_classifier: Option<CpuClassifier<P>>,
    pub(crate) queue_limit: usize,
}

impl<P: Packet> Protocol<P> {
    pub fn new<F>(id: u8, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Box<P>) + Send + Sync + 'static,
    {
        Self {
            id,
            name: name.into(),
            handler: Arc::new(handler),
            flow_classifier: None,
            cpu_classifier: None,
            queue_limit: 0,
        }
    }

    pub fn flow_classifier<F>(mut self, f: F) -> Self
    where
        F: Fn(Box<P>) -> Option<(Box<P>, FlowHint)> + Send + Sync + 'static,
    {
        self.flow_classifier = Some(Arc::new(f));
        self
    }

    pub fn cpu_classifier<F>(mut self, f: F) -> Self
    where
        F: Fn(Box<P>) -> Option<(Box<P>, CpuId, Affinity)> + Send + Sync + 'static,
    {
        self.cpu_classifier = Some(Arc::new(f));
        self
    }

    /// Per-workstream queue limit; 0 picks the configured default
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }
}

/// Installed descriptor of a registered protocol
pub(crate) struct ProtoEntry<P: Packet> {
    pub id: ProtoId,
    pub name: String,
    pub handler: Handler<P>,
    pub classifier: Classifier<P>,
    qlimit: AtomicUsize,
}

impl<P: Packet> ProtoEntry<P> {
    pub fn new(id: ProtoId, proto: Protocol<P>, classifier: Classifier<P>, limit: usize) -> Self {
        Self {
            id,
            name: proto.name,
            handler: proto.handler,
            classifier,
            qlimit: AtomicUsize::new(limit),
        }
    }

    pub fn policy(&self) -> Policy {
        match self.classifier {
            Classifier::Cpu(_) => Policy::Cpu,
            Classifier::Flow(_) => Policy::Flow,
            Classifier::None => Policy::Source,
        }
    }

    #[inline]
    pub fn queue_limit(&self) -> usize {
        self.qlimit.load(Ordering::Acquire)
    }

    pub fn set_queue_limit(&self, limit: usize) {
        self.qlimit.store(limit, Ordering::Release);
    }

    /// Run the handler on every unit of a batch, in order
    pub fn handle_all(&self, units: impl Iterator<Item = Box<P>>) {
        for unit in units {
            (self.handler)(unit);
        }
    }
}

type ProtoTable<P> = Vec<Option<Arc<ProtoEntry<P>>>>;

pub(crate) struct Registry<P: Packet> {
    table: RwLock<ProtoTable<P>>,
    global: Option<RwLock<()>>,
}

impl<P: Packet> Registry<P> {
    pub fn new(registry_lock: bool) -> Self {
        Self {
            table: RwLock::new((0..MAX_PROTOS).map(|_| None).collect()),
            global: registry_lock.then(|| RwLock::new(())),
        }
    }

    /// Shared handle to a registered protocol
    pub fn lookup(&self, id: ProtoId) -> Option<Arc<ProtoEntry<P>>> {
        self.read().get(id.as_usize()).and_then(|slot| slot.clone())
    }

    /// Every registered protocol in id order
    pub fn entries(&self) -> Vec<Arc<ProtoEntry<P>>> {
        self.read().iter().flatten().cloned().collect()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ProtoTable<P>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ProtoTable<P>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the global lock shared, if enabled
    pub fn enter(&self) -> RegistryReadGuard<'_> {
        let Some(lock) = &self.global else {
            return RegistryReadGuard {
                _guard: None,
                entry: None,
            };
        };
        let entry = tls::lock_enter(self as *const Self as usize);
        let guard = match entry {
            LockEntry::Nested => None,
            LockEntry::Outer | LockEntry::Foreign => {
                Some(lock.read().unwrap_or_else(PoisonError::into_inner))
            }
        };
        RegistryReadGuard {
            _guard: guard,
            entry: Some(entry),
        }
    }

    /// Hold the global lock exclusive, if enabled
    ///
    /// # Panics
    ///
    /// If the calling thread already holds the lock shared, i.e. from inside
    /// a handler or classifier; waiting would never return.
    pub fn exclusive(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        let lock = self.global.as_ref()?;
        if tls::lock_held(self as *const Self as usize) {
            panic!(
                "protocol registration changed from a handler while registry_lock is enabled"
            );
        }
        Some(lock.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Shared hold on the global registry lock
pub(crate) struct RegistryReadGuard<'a> {
    _guard: Option<RwLockReadGuard<'a, ()>>,
    entry: Option<LockEntry>,
}

impl Drop for RegistryReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry {
            tls::lock_exit(entry);
        }
    }
}
