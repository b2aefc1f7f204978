//! Thread-local dispatcher context
//!
//! Worker threads record the CPU of the workstream they serve, and every
//! thread tracks how deep it is inside the optional registry read lock so
//! handlers that dispatch again do not re-acquire it.

use flowdisp_core::proto::CpuId;
use std::cell::Cell;

const NO_CPU: usize = usize::MAX;

thread_local! {
    /// CPU served by this worker thread
    static WORKER_CPU: Cell<usize> = const { Cell::new(NO_CPU) };

    /// Registry whose read lock this thread holds (address), and how often
    static LOCK_OWNER: Cell<usize> = const { Cell::new(0) };
    static LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Mark the calling thread as the worker for `cpu`
#[inline]
pub fn set_worker_cpu(cpu: CpuId) {
    WORKER_CPU.with(|cell| cell.set(cpu));
}

#[inline]
pub fn clear_worker_cpu() {
    WORKER_CPU.with(|cell| cell.set(NO_CPU));
}

/// CPU served by this thread, `None` off worker threads
#[inline]
pub fn current_cpu() -> Option<CpuId> {
    let cpu = WORKER_CPU.with(|cell| cell.get());
    if cpu == NO_CPU {
        None
    } else {
        Some(cpu)
    }
}

#[inline]
pub fn is_worker() -> bool {
    current_cpu().is_some()
}

/// How a registry read-lock acquisition relates to what this thread holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockEntry {
    /// First acquisition for this registry; take the lock
    Outer,
    /// Already held by this thread; only the depth changes
    Nested,
    /// This thread holds another registry's lock; take it, do not track
    Foreign,
}

pub(crate) fn lock_enter(owner: usize) -> LockEntry {
    let depth = LOCK_DEPTH.with(|d| d.get());
    if depth == 0 {
        LOCK_OWNER.with(|o| o.set(owner));
        LOCK_DEPTH.with(|d| d.set(1));
        LockEntry::Outer
    } else if LOCK_OWNER.with(|o| o.get()) == owner {
        LOCK_DEPTH.with(|d| d.set(depth + 1));
        LockEntry::Nested
    } else {
        LockEntry::Foreign
    }
}

/// Whether this thread holds the read lock of registry `owner`
pub(crate) fn lock_held(owner: usize) -> bool {
    LOCK_DEPTH.with(|d| d.get()) > 0 && LOCK_OWNER.with(|o| o.get()) == owner
}

pub(crate) fn lock_exit(entry: LockEntry) {
    match entry {
        LockEntry::Outer | LockEntry::Nested => {
            let depth = LOCK_DEPTH.with(|d| d.get());
            debug_assert!(depth > 0, "registry lock depth underflow");
            let depth = depth.saturating_sub(1);
            LOCK_DEPTH.with(|d| d.set(depth));
            if depth == 0 {
                LOCK_OWNER.with(|o| o.set(0));
            }
        }
        LockEntry::Foreign => {}
    }
}
