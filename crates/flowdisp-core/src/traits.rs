//! Host environment traits
//!
//! The dispatcher never talks to the OS scheduler directly. CPU discovery,
//! "which CPU am I on" and thread pinning come from a [`Topology`]
//! implementation supplied by the runtime (or by the embedder).

use crate::error::TopologyError;
use crate::proto::CpuId;

/// CPU topology and affinity primitives of the host
pub trait Topology: Send + Sync {
    /// The CPU brought up first; always gets a workstream
    fn primary_cpu(&self) -> CpuId;

    /// Online CPUs in bring-up order, primary included
    fn online_cpus(&self) -> Vec<CpuId>;

    /// CPU the calling thread is running on right now (may be stale)
    fn current_cpu(&self) -> CpuId;

    /// Keep the calling thread on its current CPU until the matching
    /// [`unpin_current`](Topology::unpin_current), returning that CPU
    ///
    /// Calls nest; only the outermost pair changes the thread's affinity.
    fn pin_current(&self) -> CpuId;

    /// Undo the innermost [`pin_current`](Topology::pin_current)
    fn unpin_current(&self);

    /// Bind the calling thread to `cpu` for the rest of its life
    fn bind_thread(&self, cpu: CpuId) -> Result<(), TopologyError>;

    /// Short platform name for diagnostics
    fn name(&self) -> &'static str;
}
