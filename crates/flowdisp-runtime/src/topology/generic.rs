//! Portable fallback topology
//!
//! Used on platforms without an affinity API wired up. CPUs are numbered
//! `0..available_parallelism`; the current CPU is the worker's own when
//! called from a worker and the primary otherwise, and pinning is a no-op.

use flowdisp_core::error::TopologyError;
use flowdisp_core::proto::CpuId;
use flowdisp_core::Topology;

pub struct GenericTopology {
    count: usize,
}

impl GenericTopology {
    pub fn new() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { count }
    }
}

impl Default for GenericTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology for GenericTopology {
    fn primary_cpu(&self) -> CpuId {
        0
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        (0..self.count).collect()
    }

    fn current_cpu(&self) -> CpuId {
        crate::tls::current_cpu().unwrap_or(0)
    }

    fn pin_current(&self) -> CpuId {
        self.current_cpu()
    }

    fn unpin_current(&self) {}

    fn bind_thread(&self, cpu: CpuId) -> Result<(), TopologyError> {
        if cpu < self.count {
            Ok(())
        } else {
            Err(TopologyError::CpuUnavailable(cpu))
        }
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}
