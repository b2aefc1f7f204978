//! Scope guard keeping a producer on one CPU for the length of a dispatch

use crate::tls;
use flowdisp_core::proto::CpuId;
use flowdisp_core::Topology;

/// Pins the calling thread until dropped
///
/// Worker threads are already tied to their workstream's CPU; for them the
/// guard only reports that CPU and leaves the thread alone.
pub struct CpuPin<'a> {
    topology: &'a dyn Topology,
    cpu: CpuId,
    pinned: bool,
}

impl<'a> CpuPin<'a> {
    pub fn new(topology: &'a dyn Topology) -> Self {
        match tls::current_cpu() {
            Some(cpu) => Self {
                topology,
                cpu,
                pinned: false,
            },
            None => Self {
                topology,
                cpu: topology.pin_current(),
                pinned: true,
            },
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for CpuPin<'_> {
    fn drop(&mut self) {
        if self.pinned {
            self.topology.unpin_current();
        }
    }
}
