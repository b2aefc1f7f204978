//! Linux topology
//!
//! The online set is the process affinity mask sampled at creation, so a
//! process started under `taskset` only gets workstreams on its own CPUs.
//!
//! Pinning a producer saves its affinity mask, narrows it to the CPU it is
//! running on, and restores the saved mask when the outermost pin is
//! released. If the mask cannot be changed the pin degrades to a plain
//! `sched_getcpu` sample.

use flowdisp_core::error::TopologyError;
use flowdisp_core::proto::CpuId;
use flowdisp_core::Topology;

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::cell::RefCell;

struct PinState {
    depth: usize,
    cpu: CpuId,
    saved: Option<CpuSet>,
}

thread_local! {
    static PIN: RefCell<PinState> = const {
        RefCell::new(PinState { depth: 0, cpu: 0, saved: None })
    };
}

/// Linux topology backed by `sched_getaffinity`/`sched_setaffinity`
pub struct LinuxTopology {
    cpus: Vec<CpuId>,
}

impl LinuxTopology {
    pub fn new() -> Self {
        let mut cpus: Vec<CpuId> = match sched_getaffinity(Pid::from_raw(0)) {
            Ok(set) => (0..CpuSet::count())
                .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        };
        if cpus.is_empty() {
            cpus.push(0);
        }
        Self { cpus }
    }

    fn single(cpu: CpuId) -> Result<CpuSet, TopologyError> {
        let mut set = CpuSet::new();
        set.set(cpu)
            .map_err(|_| TopologyError::CpuUnavailable(cpu))?;
        Ok(set)
    }
}

impl Default for LinuxTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology for LinuxTopology {
    fn primary_cpu(&self) -> CpuId {
        self.cpus[0]
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        self.cpus.clone()
    }

    fn current_cpu(&self) -> CpuId {
        // Safety: sched_getcpu takes no arguments and only reads.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            self.primary_cpu()
        } else {
            cpu as CpuId
        }
    }

    fn pin_current(&self) -> CpuId {
        PIN.with(|pin| {
            let mut pin = pin.borrow_mut();
            if pin.depth > 0 {
                pin.depth += 1;
                return pin.cpu;
            }

            let cpu = self.current_cpu();
            let saved = sched_getaffinity(Pid::from_raw(0)).ok().filter(|_| {
                Self::single(cpu)
                    .ok()
                    .and_then(|one| sched_setaffinity(Pid::from_raw(0), &one).ok())
                    .is_some()
            });

            pin.depth = 1;
            pin.cpu = cpu;
            pin.saved = saved;
            cpu
        })
    }

    fn unpin_current(&self) {
        PIN.with(|pin| {
            let mut pin = pin.borrow_mut();
            debug_assert!(pin.depth > 0, "unpin without pin");
            pin.depth = pin.depth.saturating_sub(1);
            if pin.depth == 0 {
                if let Some(saved) = pin.saved.take() {
                    let _ = sched_setaffinity(Pid::from_raw(0), &saved);
                }
            }
        })
    }

    fn bind_thread(&self, cpu: CpuId) -> Result<(), TopologyError> {
        let set = Self::single(cpu)?;
        sched_setaffinity(Pid::from_raw(0), &set)
            .map_err(|errno| TopologyError::AffinityFailed(errno as i32))
    }

    fn name(&self) -> &'static str {
        "linux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_set_contains_current() {
        let topo = LinuxTopology::new();
        let cpu = topo.pin_current();
        assert!(topo.online_cpus().contains(&cpu));
        topo.unpin_current();
    }

    #[test]
    fn test_unpin_restores_mask() {
        let topo = LinuxTopology::new();
        let before = sched_getaffinity(Pid::from_raw(0)).ok();
        topo.pin_current();
        topo.unpin_current();
        let after = sched_getaffinity(Pid::from_raw(0)).ok();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bind_out_of_range() {
        let topo = LinuxTopology::new();
        let err = topo.bind_thread(CpuSet::count() + 1).unwrap_err();
        assert_eq!(err, TopologyError::CpuUnavailable(CpuSet::count() + 1));
    }
}
