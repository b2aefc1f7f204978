//! Units of work carried through the dispatcher
//!
//! A unit is owned through a `Box` and links to the next unit through a slot
//! embedded in the unit itself, so queueing never allocates list nodes.
//! Dropping a `Box<P>` is how the core disposes of a unit.

use core::fmt;

use crate::proto::FlowId;

/// A unit of work that can sit on a [`WorkQueue`](crate::queue::WorkQueue)
///
/// The `next` slot belongs to whichever queue currently holds the unit.
/// Outside a queue it must be `None`; the queue asserts this on push.
pub trait Packet: Send + Sized + 'static {
    /// Intrusive link to the next unit in a queue
    fn next_slot(&mut self) -> &mut Option<Box<Self>>;
}

/// Packet buffer used by the process-global dispatcher and the demos
///
/// Carries an opaque payload and an optional precomputed flow id (what a
/// NIC would report as its receive hash).
pub struct PacketBuf {
    data: Vec<u8>,
    flow: Option<FlowId>,
    ifindex: u16,
    next: Option<Box<PacketBuf>>,
}

impl PacketBuf {
    pub fn new(data: impl Into<Vec<u8>>) -> Box<Self> {
        Box::new(Self {
            data: data.into(),
            flow: None,
            ifindex: 0,
            next: None,
        })
    }

    /// Create a packet tagged with a receive flow id
    pub fn with_flow(data: impl Into<Vec<u8>>, flow: FlowId) -> Box<Self> {
        let mut pkt = Self::new(data);
        pkt.flow = Some(flow);
        pkt
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn flow(&self) -> Option<FlowId> {
        self.flow
    }

    pub fn set_flow(&mut self, flow: FlowId) {
        self.flow = Some(flow);
    }

    #[inline]
    pub fn ifindex(&self) -> u16 {
        self.ifindex
    }

    pub fn set_ifindex(&mut self, ifindex: u16) {
        self.ifindex = ifindex;
    }
}

impl Packet for PacketBuf {
    #[inline]
    fn next_slot(&mut self) -> &mut Option<Box<Self>> {
        &mut self.next
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.data.len())
            .field("flow", &self.flow)
            .field("ifindex", &self.ifindex)
            .field("linked", &self.next.is_some())
            .finish()
    }
}
