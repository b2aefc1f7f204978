//! Protocol identifiers and affinity types

use core::fmt;
use core::str::FromStr;

use crate::constants::MAX_PROTOS;

/// Logical CPU number as reported by the host topology
pub type CpuId = usize;

/// Flow identifier used to keep related units on one workstream
pub type FlowId = u32;

/// Identifier of a registered protocol
///
/// A small integer below [`MAX_PROTOS`]. It doubles as the index of the
/// protocol's queue inside every workstream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProtoId(u8);

impl ProtoId {
    /// Create a protocol id, returning `None` when out of range
    #[inline]
    pub const fn new(id: u8) -> Option<Self> {
        if (id as usize) < MAX_PROTOS {
            Some(ProtoId(id))
        } else {
            None
        }
    }

    /// Create a protocol id without a range check
    ///
    /// Out-of-range ids are rejected at registration time and panic on
    /// dispatch, so this is only a convenience for constants.
    #[inline]
    pub const fn new_unchecked(id: u8) -> Self {
        ProtoId(id)
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Get as usize for indexing queue tables
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_PROTOS
    }

    /// Iterate every protocol slot in id order
    pub fn all() -> impl Iterator<Item = ProtoId> {
        (0..MAX_PROTOS as u8).map(ProtoId)
    }
}

impl fmt::Debug for ProtoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtoId({})", self.0)
    }
}

impl fmt::Display for ProtoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Affinity strength of a placement decision
///
/// `Weak` treats the target CPU as a hint: running the handler inline on
/// whichever CPU the producer is on is acceptable. `Strong` requires the
/// target CPU to be honored, queueing if the producer is elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Affinity {
    Weak = 0,
    Strong = 1,
}

impl Affinity {
    #[inline]
    pub const fn is_strong(self) -> bool {
        matches!(self, Affinity::Strong)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Affinity::Weak => "weak",
            Affinity::Strong => "strong",
        }
    }
}

impl Default for Affinity {
    fn default() -> Self {
        Affinity::Weak
    }
}

impl From<u8> for Affinity {
    fn from(v: u8) -> Self {
        match v {
            1 => Affinity::Strong,
            _ => Affinity::Weak,
        }
    }
}

impl FromStr for Affinity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weak" | "0" => Ok(Affinity::Weak),
            "strong" | "1" => Ok(Affinity::Strong),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a protocol derives its target CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// A CPU classifier picks the CPU and affinity directly
    Cpu,
    /// A flow classifier yields a flow id that is folded onto a CPU
    Flow,
    /// No classifier; the protocol id itself is folded onto a CPU
    Source,
}

impl Policy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Policy::Cpu => "cpu",
            Policy::Flow => "flow",
            Policy::Source => "source",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_id_range() {
        assert!(ProtoId::new(0).is_some());
        assert!(ProtoId::new((MAX_PROTOS - 1) as u8).is_some());
        assert!(ProtoId::new(MAX_PROTOS as u8).is_none());
        assert!(!ProtoId::new_unchecked(200).is_valid());
    }

    #[test]
    fn test_proto_id_iteration_order() {
        let ids: Vec<usize> = ProtoId::all().map(|p| p.as_usize()).collect();
        assert_eq!(ids.len(), MAX_PROTOS);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_affinity_parse() {
        assert_eq!("weak".parse::<Affinity>(), Ok(Affinity::Weak));
        assert_eq!("STRONG".parse::<Affinity>(), Ok(Affinity::Strong));
        assert_eq!("1".parse::<Affinity>(), Ok(Affinity::Strong));
        assert!("sticky".parse::<Affinity>().is_err());
        assert_eq!(Affinity::from(7u8), Affinity::Weak);
    }
}
