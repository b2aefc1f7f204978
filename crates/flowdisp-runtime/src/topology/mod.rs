//! Host topology implementations
//!
//! - `LinuxTopology` - online set from the process affinity mask, current
//!   CPU from `sched_getcpu`, pinning through `sched_setaffinity`
//! - `GenericTopology` - portable fallback; no real pinning
//! - `VirtualTopology` - a fixed logical CPU set with per-thread "current
//!   CPU", for tests and for embedders that map workstreams onto something
//!   other than physical CPUs

mod virtual_cpus;

pub use virtual_cpus::VirtualTopology;

use flowdisp_core::Topology;
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::LinuxTopology as PlatformTopology;
    } else {
        mod generic;
        pub use generic::GenericTopology as PlatformTopology;
    }
}

/// Create the topology for the platform we are running on
pub fn new_topology() -> Arc<dyn Topology> {
    Arc::new(PlatformTopology::new())
}
