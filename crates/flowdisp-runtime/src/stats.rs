//! Read-only snapshot of dispatcher state
//!
//! `Display` renders the snapshot as the text dump printed by the demo
//! programs.

use flowdisp_core::proto::{CpuId, Policy, ProtoId};
use flowdisp_core::queue::{QueueCounters, QueueStats};

use std::fmt;

/// A registered protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub id: ProtoId,
    pub name: String,
    pub policy: Policy,
    pub queue_limit: usize,
}

/// One protocol's queue on one workstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub proto: ProtoId,
    pub name: String,
    pub stats: QueueStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkstreamStats {
    pub index: usize,
    pub cpu: CpuId,
    pub pending: usize,
    pub running: bool,
    pub signaled: bool,
    /// Registered protocols only, in id order
    pub queues: Vec<QueueReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub topology: &'static str,
    pub direct_dispatch: bool,
    pub max_threads: usize,
    pub default_queue_limit: usize,
    pub max_queue_limit: usize,
    pub protocols: Vec<ProtocolInfo>,
    pub workstreams: Vec<WorkstreamStats>,
    pub excluded_cpus: Vec<CpuId>,
}

impl DispatchStats {
    pub fn workstream(&self, cpu: CpuId) -> Option<&WorkstreamStats> {
        self.workstreams.iter().find(|ws| ws.cpu == cpu)
    }

    /// Queue of `proto` on the workstream for `cpu`
    pub fn queue(&self, cpu: CpuId, proto: ProtoId) -> Option<&QueueStats> {
        self.workstream(cpu)?
            .queues
            .iter()
            .find(|q| q.proto == proto)
            .map(|q| &q.stats)
    }

    /// Counters of `proto` summed over every workstream
    pub fn totals(&self, proto: ProtoId) -> QueueCounters {
        let mut sum = QueueCounters::default();
        for q in self
            .workstreams
            .iter()
            .flat_map(|ws| ws.queues.iter())
            .filter(|q| q.proto == proto)
        {
            sum.dispatched += q.stats.counters.dispatched;
            sum.drops += q.stats.counters.drops;
            sum.queued += q.stats.counters.queued;
            sum.handled += q.stats.counters.handled;
        }
        sum
    }

    /// Units waiting across all workstreams
    pub fn pending(&self) -> usize {
        self.workstreams.iter().map(|ws| ws.pending).sum()
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "{:<32}{:>10}", "Setting", "Current")?;
        writeln!(f, "{:<32}{:>10}", "Topology", self.topology)?;
        writeln!(f, "{:<32}{:>10}", "Thread count", self.workstreams.len())?;
        writeln!(f, "{:<32}{:>10}", "Max threads", self.max_threads)?;
        writeln!(
            f,
            "{:<32}{:>10}",
            "Direct dispatch",
            if self.direct_dispatch { "enabled" } else { "disabled" }
        )?;
        writeln!(f, "{:<32}{:>10}", "Default queue limit", self.default_queue_limit)?;
        writeln!(f, "{:<32}{:>10}", "Max queue limit", self.max_queue_limit)?;
        if !self.excluded_cpus.is_empty() {
            let cpus: Vec<String> = self.excluded_cpus.iter().map(|c| c.to_string()).collect();
            writeln!(f, "{:<32}{:>10}", "Excluded CPUs", cpus.join(","))?;
        }

        writeln!(f)?;
        writeln!(f, "Protocols:")?;
        writeln!(f, "{:<10}{:>6}{:>8}{:>8}", "Name", "Proto", "QLimit", "Policy")?;
        for p in &self.protocols {
            writeln!(
                f,
                "{:<10}{:>6}{:>8}{:>8}",
                p.name,
                p.id.as_u8(),
                p.queue_limit,
                p.policy.as_str()
            )?;
        }

        writeln!(f)?;
        writeln!(f, "Workstreams:")?;
        writeln!(
            f,
            "{:>4}{:>5} {:<10}{:>6}{:>7}{:>10}{:>9}{:>10}{:>10}",
            "WSID", "CPU", "Name", "Len", "WMark", "Disp'd", "Drops", "Queued", "Handled"
        )?;
        for ws in &self.workstreams {
            for q in &ws.queues {
                let c = &q.stats.counters;
                writeln!(
                    f,
                    "{:>4}{:>5} {:<10}{:>6}{:>7}{:>10}{:>9}{:>10}{:>10}",
                    ws.index,
                    ws.cpu,
                    q.name,
                    q.stats.len,
                    q.stats.watermark,
                    c.dispatched,
                    c.drops,
                    c.queued,
                    c.handled
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(proto: u8, drops: u64, handled: u64) -> QueueReport {
        QueueReport {
            proto: ProtoId::new(proto).unwrap(),
            name: format!("p{}", proto),
            stats: QueueStats {
                len: 0,
                watermark: 0,
                limit: 4,
                counters: QueueCounters {
                    dispatched: 0,
                    drops,
                    queued: handled,
                    handled,
                },
            },
        }
    }

    fn sample() -> DispatchStats {
        DispatchStats {
            topology: "virtual",
            direct_dispatch: true,
            max_threads: 2,
            default_queue_limit: 256,
            max_queue_limit: 10240,
            protocols: vec![ProtocolInfo {
                id: ProtoId::new(7).unwrap(),
                name: "p7".to_string(),
                policy: Policy::Flow,
                queue_limit: 4,
            }],
            workstreams: vec![
                WorkstreamStats {
                    index: 0,
                    cpu: 0,
                    pending: 0,
                    running: false,
                    signaled: false,
                    queues: vec![report(7, 1, 4)],
                },
                WorkstreamStats {
                    index: 1,
                    cpu: 1,
                    pending: 0,
                    running: false,
                    signaled: false,
                    queues: vec![report(7, 2, 3)],
                },
            ],
            excluded_cpus: vec![2, 3],
        }
    }

    #[test]
    fn test_totals() {
        let s = sample();
        let t = s.totals(ProtoId::new(7).unwrap());
        assert_eq!(t.drops, 3);
        assert_eq!(t.handled, 7);
        assert_eq!(s.queue(1, ProtoId::new(7).unwrap()).unwrap().counters.drops, 2);
        assert!(s.queue(5, ProtoId::new(7).unwrap()).is_none());
    }

    #[test]
    fn test_display() {
        let text = sample().to_string();
        assert!(text.contains("Direct dispatch"));
        assert!(text.contains("Excluded CPUs"));
        assert!(text.contains("2,3"));
        assert!(text.contains("p7"));
        assert!(text.contains("Handled"));
    }
}
