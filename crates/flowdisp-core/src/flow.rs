//! Flow id folding
//!
//! Maps a 32-bit flow id onto a workstream index. The fold is a pure
//! function of the flow id and the number of active workstreams, which is
//! what keeps every unit of a flow on the same worker.

use crate::proto::FlowId;

/// At or below this many workstreams the folded byte is folded again
/// into a nibble.
pub const NIBBLE_FOLD_MAX: usize = 16;

/// XOR the four bytes of a flow id together
#[inline]
pub const fn fold_bytes(flow: FlowId) -> u8 {
    let b = flow.to_le_bytes();
    b[0] ^ b[1] ^ b[2] ^ b[3]
}

/// XOR the two nibbles of a byte together
#[inline]
pub const fn fold_nibbles(byte: u8) -> u8 {
    (byte >> 4) ^ (byte & 0x0f)
}

/// Pick a workstream index for `flow` out of `count` active workstreams
///
/// `count` must be non-zero.
#[inline]
pub fn flow_index(flow: FlowId, count: usize) -> usize {
    debug_assert!(count > 0, "no active workstreams");
    let mut folded = fold_bytes(flow);
    if count <= NIBBLE_FOLD_MAX {
        folded = fold_nibbles(folded);
    }
    folded as usize % count
}
