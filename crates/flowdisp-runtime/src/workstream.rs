//! Per-CPU workstream
//!
//! One queue per protocol slot, a pending total, and the `running` /
//! `signaled` flags, all behind a single mutex. The condvar is only waited on
//! by the workstream's own worker thread.
//!
//! Invariant: `pending` equals the sum of the queue lengths.

use flowdisp_core::constants::MAX_PROTOS;
use flowdisp_core::error::{DispatchError, DispatchResult};
use flowdisp_core::proto::{CpuId, ProtoId};
use flowdisp_core::{Packet, WorkQueue};

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

pub(crate) struct StreamState<P: Packet> {
    pub queues: [WorkQueue<P>; MAX_PROTOS],
    pub pending: usize,
    /// Worker is draining
    pub running: bool,
    /// A wake-up is already on its way
    pub signaled: bool,
    pub shutdown: bool,
}

impl<P: Packet> StreamState<P> {
    #[inline]
    pub fn queue(&mut self, proto: ProtoId) -> &mut WorkQueue<P> {
        &mut self.queues[proto.as_usize()]
    }
}

pub(crate) struct Workstream<P: Packet> {
    pub cpu: CpuId,
    pub index: usize,
    state: Mutex<StreamState<P>>,
    cond: Condvar,
}

impl<P: Packet> Workstream<P> {
    /// Create a workstream whose queue limits come from `limits` (0 for
    /// unregistered slots)
    pub fn new(cpu: CpuId, index: usize, limits: [usize; MAX_PROTOS]) -> Self {
        Self {
            cpu,
            index,
            state: Mutex::new(StreamState {
                queues: std::array::from_fn(|i| WorkQueue::with_limit(limits[i])),
                pending: 0,
                running: false,
                signaled: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StreamState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block the worker until there is work or shutdown is requested
    ///
    /// Returns `None` on shutdown with nothing left to drain. The pending
    /// check and the wait happen under the same lock, so a producer that
    /// enqueues in between cannot be missed.
    pub fn wait_for_work<'a>(
        &'a self,
        mut st: MutexGuard<'a, StreamState<P>>,
    ) -> Option<MutexGuard<'a, StreamState<P>>> {
        while st.pending == 0 {
            if st.shutdown {
                st.running = false;
                return None;
            }
            st.running = false;
            st.signaled = false;
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.running = true;
        Some(st)
    }

    /// Append a unit to the protocol's queue and wake the worker
    ///
    /// A full queue counts a drop and disposes of the unit after the lock is
    /// released.
    pub fn enqueue(&self, proto: ProtoId, unit: Box<P>) -> DispatchResult<()> {
        let mut st = self.lock();
        match st.queue(proto).push(unit) {
            Ok(()) => {
                st.pending += 1;
                let wake = !st.signaled;
                st.signaled = true;
                drop(st);
                if wake {
                    self.cond.notify_one();
                }
                Ok(())
            }
            Err(unit) => {
                drop(st);
                drop(unit);
                Err(DispatchError::NoBufferSpace)
            }
        }
    }

    /// Account one unit run inline on this workstream
    pub fn record_inline(&self, proto: ProtoId) {
        self.lock().queue(proto).record_inline();
    }

    /// Prepare a slot for a newly registered protocol
    pub fn install(&self, proto: ProtoId, limit: usize) {
        let stale = {
            let mut st = self.lock();
            let stale = st.queue(proto).flush();
            st.pending -= stale.len();
            st.queue(proto).reset(limit);
            stale
        };
        drop(stale);
    }

    /// Drop every unit queued for a protocol and zero its slot
    ///
    /// Returns the number of units disposed of.
    pub fn flush(&self, proto: ProtoId) -> usize {
        let batch = {
            let mut st = self.lock();
            let batch = st.queue(proto).flush();
            st.pending -= batch.len();
            batch
        };
        let n = batch.len();
        drop(batch);
        n
    }

    pub fn set_limit(&self, proto: ProtoId, limit: usize) {
        self.lock().queue(proto).set_limit(limit);
    }

    /// Ask the worker to exit once drained
    pub fn request_shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }
}

/// Live workstreams, by bring-up index and by CPU
pub(crate) struct StreamSet<P: Packet> {
    by_index: Vec<Arc<Workstream<P>>>,
    by_cpu: HashMap<CpuId, usize>,
    /// CPUs left without a workstream because the cap was reached
    pub excluded: Vec<CpuId>,
}

impl<P: Packet> StreamSet<P> {
    pub fn new() -> Self {
        Self {
            by_index: Vec::new(),
            by_cpu: HashMap::new(),
            excluded: Vec::new(),
        }
    }

    pub fn push(&mut self, ws: Arc<Workstream<P>>) {
        debug_assert_eq!(ws.index, self.by_index.len());
        self.by_cpu.insert(ws.cpu, ws.index);
        self.by_index.push(ws);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn get(&self, cpu: CpuId) -> Option<&Arc<Workstream<P>>> {
        self.by_cpu.get(&cpu).map(|&i| &self.by_index[i])
    }

    pub fn by_index(&self, index: usize) -> Option<&Arc<Workstream<P>>> {
        self.by_index.get(index)
    }

    /// Workstream at `index`, which must be below `len()`
    #[inline]
    pub fn nth(&self, index: usize) -> &Arc<Workstream<P>> {
        &self.by_index[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workstream<P>>> {
        self.by_index.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    struct Unit {
        next: Option<Box<Unit>>,
    }

    impl Packet for Unit {
        fn next_slot(&mut self) -> &mut Option<Box<Self>> {
            &mut self.next
        }
    }

    impl Drop for Unit {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unit() -> Box<Unit> {
        Box::new(Unit { next: None })
    }

    fn limits(proto: ProtoId, limit: usize) -> [usize; MAX_PROTOS] {
        let mut l = [0; MAX_PROTOS];
        l[proto.as_usize()] = limit;
        l
    }

    #[test]
    fn test_enqueue_and_full() {
        let p = ProtoId::new(2).unwrap();
        let ws: Workstream<Unit> = Workstream::new(0, 0, limits(p, 2));
        assert!(ws.enqueue(p, unit()).is_ok());
        assert!(ws.enqueue(p, unit()).is_ok());

        let before = DROPPED.load(Ordering::SeqCst);
        assert_eq!(ws.enqueue(p, unit()), Err(DispatchError::NoBufferSpace));
        assert!(DROPPED.load(Ordering::SeqCst) > before);

        let mut st = ws.lock();
        assert_eq!(st.pending, 2);
        assert!(st.signaled);
        assert_eq!(st.queue(p).len(), 2);
        assert_eq!(st.queue(p).counters().drops, 1);
        assert_eq!(st.queue(p).counters().queued, 2);
    }

    #[test]
    fn test_unregistered_slot_rejects() {
        let p = ProtoId::new(5).unwrap();
        let ws: Workstream<Unit> = Workstream::new(0, 0, [0; MAX_PROTOS]);
        assert_eq!(ws.enqueue(p, unit()), Err(DispatchError::NoBufferSpace));
        assert_eq!(ws.lock().pending, 0);
    }

    #[test]
    fn test_flush_keeps_pending_consistent() {
        let a = ProtoId::new(0).unwrap();
        let b = ProtoId::new(1).unwrap();
        let mut l = [0; MAX_PROTOS];
        l[0] = 8;
        l[1] = 8;
        let ws: Workstream<Unit> = Workstream::new(0, 0, l);
        for _ in 0..3 {
            ws.enqueue(a, unit()).unwrap();
        }
        ws.enqueue(b, unit()).unwrap();

        assert_eq!(ws.flush(a), 3);
        let mut st = ws.lock();
        assert_eq!(st.pending, 1);
        assert_eq!(st.queue(a).limit(), 0);
        assert_eq!(st.queue(a).counters().queued, 0);
        assert_eq!(st.queue(b).len(), 1);
    }

    #[test]
    fn test_wait_returns_on_shutdown() {
        let ws: Arc<Workstream<Unit>> = Arc::new(Workstream::new(0, 0, [0; MAX_PROTOS]));
        let w = ws.clone();
        let t = std::thread::spawn(move || {
            let done = w.wait_for_work(w.lock()).is_none();
            done
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        ws.request_shutdown();
        assert!(t.join().unwrap());
    }

    #[test]
    fn test_wait_wakes_on_enqueue() {
        let p = ProtoId::new(0).unwrap();
        let ws: Arc<Workstream<Unit>> = Arc::new(Workstream::new(0, 0, limits(p, 4)));
        let w = ws.clone();
        let t = std::thread::spawn(move || {
            let st = w.wait_for_work(w.lock());
            st.map(|st| (st.pending, st.running))
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        ws.enqueue(p, unit()).unwrap();
        assert_eq!(t.join().unwrap(), Some((1, true)));
    }
}
