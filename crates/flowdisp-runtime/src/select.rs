//! Dispatch selector
//!
//! Turns a unit plus the caller's hint into a target workstream and an
//! affinity strength. Classification runs without any dispatcher lock held;
//! only the mapping onto a workstream looks at the stream set.

use crate::registry::{Classifier, ProtoEntry};
use crate::workstream::{StreamSet, Workstream};

use flowdisp_core::error::{DispatchError, DispatchResult};
use flowdisp_core::flow::flow_index;
use flowdisp_core::proto::{Affinity, CpuId, FlowId};
use flowdisp_core::{kdebug, Packet};

use std::sync::Arc;

/// What the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Let the protocol's classifier decide
    Classify,
    /// Explicit CPU; always strong
    Cpu(CpuId),
    /// Explicit flow; configured default affinity
    Flow(FlowId),
}

/// Outcome of classification, before it is mapped onto a workstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Choice {
    /// CPU picked by a CPU classifier; remapped if it has no workstream
    Cpu(CpuId, Affinity),
    /// CPU named by the caller; must have a workstream
    ExactCpu(CpuId),
    Flow(FlowId, Affinity),
}

impl Choice {
    pub fn affinity(&self) -> Affinity {
        match *self {
            Choice::Cpu(_, affinity) | Choice::Flow(_, affinity) => affinity,
            Choice::ExactCpu(_) => Affinity::Strong,
        }
    }
}

/// Run the protocol's classifier (or apply the caller's hint)
///
/// A classifier that returns `None` has consumed the unit.
pub(crate) fn classify<P: Packet>(
    entry: &ProtoEntry<P>,
    unit: Box<P>,
    target: Target,
    default_affinity: Affinity,
) -> DispatchResult<(Box<P>, Choice)> {
    match target {
        Target::Cpu(cpu) => Ok((unit, Choice::ExactCpu(cpu))),
        Target::Flow(flow) => Ok((unit, Choice::Flow(flow, default_affinity))),
        Target::Classify => match &entry.classifier {
            Classifier::Cpu(f) => {
                let (unit, cpu, affinity) = f(unit).ok_or(DispatchError::NoResources)?;
                Ok((unit, Choice::Cpu(cpu, affinity)))
            }
            Classifier::Flow(f) => {
                let (unit, hint) = f(unit).ok_or(DispatchError::NoResources)?;
                let affinity = hint.affinity.unwrap_or(default_affinity);
                Ok((unit, Choice::Flow(hint.flow, affinity)))
            }
            Classifier::None => Ok((
                unit,
                Choice::Flow(entry.id.as_u8() as FlowId, Affinity::Weak),
            )),
        },
    }
}

impl<P: Packet> StreamSet<P> {
    /// Workstream serving `flow`
    ///
    /// Pure function of the flow id and the current set of workstreams.
    pub fn flow_to_stream(&self, flow: FlowId) -> &Arc<Workstream<P>> {
        self.nth(flow_index(flow, self.len()))
    }

    /// Map a classification onto a live workstream
    ///
    /// # Panics
    ///
    /// If the caller named a CPU that has no workstream.
    pub fn resolve(&self, choice: Choice) -> &Arc<Workstream<P>> {
        match choice {
            Choice::ExactCpu(cpu) => match self.get(cpu) {
                Some(ws) => ws,
                None => panic!("dispatch to cpu {} which has no workstream", cpu),
            },
            Choice::Cpu(cpu, _) => match self.get(cpu) {
                Some(ws) => ws,
                None => {
                    let ws = self.flow_to_stream(cpu as FlowId);
                    kdebug!(
                        "classifier picked cpu {} without a workstream, using cpu {}",
                        cpu,
                        ws.cpu
                    );
                    ws
                }
            },
            Choice::Flow(flow, _) => self.flow_to_stream(flow),
        }
    }
}
