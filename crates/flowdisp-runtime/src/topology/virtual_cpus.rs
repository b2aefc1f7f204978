//! Logical CPU set decoupled from the hardware
//!
//! Every thread starts "on" the primary CPU. Producer threads can move
//! themselves with [`VirtualTopology::set_current_cpu`]; worker threads are
//! reported on the CPU of the workstream they serve.

use flowdisp_core::error::TopologyError;
use flowdisp_core::proto::CpuId;
use flowdisp_core::Topology;

use std::cell::Cell;
use std::sync::Mutex;

thread_local! {
    static CURRENT: Cell<Option<CpuId>> = const { Cell::new(None) };
}

pub struct VirtualTopology {
    cpus: Vec<CpuId>,
    bound: Mutex<Vec<CpuId>>,
}

impl VirtualTopology {
    /// CPUs `0..count`
    pub fn new(count: usize) -> Self {
        Self::with_cpus((0..count.max(1)).collect())
    }

    /// An explicit CPU list in bring-up order; the first one is primary
    pub fn with_cpus(cpus: Vec<CpuId>) -> Self {
        assert!(!cpus.is_empty(), "topology needs at least one cpu");
        Self {
            cpus,
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Pretend the calling thread now runs on `cpu`
    pub fn set_current_cpu(cpu: CpuId) {
        CURRENT.with(|c| c.set(Some(cpu)));
    }

    /// Return the calling thread to the primary CPU
    pub fn clear_current_cpu() {
        CURRENT.with(|c| c.set(None));
    }

    /// CPUs passed to `bind_thread` so far, in call order
    pub fn bound_cpus(&self) -> Vec<CpuId> {
        self.bound.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl Topology for VirtualTopology {
    fn primary_cpu(&self) -> CpuId {
        self.cpus[0]
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        self.cpus.clone()
    }

    fn current_cpu(&self) -> CpuId {
        CURRENT
            .with(|c| c.get())
            .or_else(crate::tls::current_cpu)
            .unwrap_or(self.cpus[0])
    }

    fn pin_current(&self) -> CpuId {
        self.current_cpu()
    }

    fn unpin_current(&self) {}

    fn bind_thread(&self, cpu: CpuId) -> Result<(), TopologyError> {
        if !self.cpus.contains(&cpu) {
            return Err(TopologyError::CpuUnavailable(cpu));
        }
        if let Ok(mut bound) = self.bound.lock() {
            bound.push(cpu);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "virtual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_cpu_override() {
        let topo = VirtualTopology::new(4);
        assert_eq!(topo.current_cpu(), 0);
        VirtualTopology::set_current_cpu(2);
        assert_eq!(topo.pin_current(), 2);
        topo.unpin_current();
        VirtualTopology::clear_current_cpu();
        assert_eq!(topo.current_cpu(), 0);
    }

    #[test]
    fn test_explicit_cpu_list() {
        let topo = VirtualTopology::with_cpus(vec![3, 5, 9]);
        assert_eq!(topo.primary_cpu(), 3);
        assert_eq!(topo.online_cpus(), vec![3, 5, 9]);
        assert!(topo.bind_thread(5).is_ok());
        assert_eq!(topo.bind_thread(4), Err(TopologyError::CpuUnavailable(4)));
        assert_eq!(topo.bound_cpus(), vec![5]);
    }
}
