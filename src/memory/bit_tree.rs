//! Constant tables for the 6-level binary buddy tree packed into one `u64`.
//!
//! The tree has 32 leaves and 63 nodes stored in heap order: the root is bit
//! 0, the children of bit `b` are `2b + 1` and `2b + 2`, and level `k` occupies
//! bits `[2^k - 1, 2^(k+1) - 1)`.
//!
//! ```text
//!   level 0   bit  0                                   (1 node,   whole block)
//!   level 1   bits 1..=2                               (2 nodes,  1/2 block)
//!   level 2   bits 3..=6                               (4 nodes,  1/4 block)
//!   level 3   bits 7..=14                              (8 nodes,  1/8 block)
//!   level 4   bits 15..=30                             (16 nodes, 1/16 block)
//!   level 5   bits 31..=62                             (32 leaves)
//! ```
//!
//! In a block's `mips` word a set bit means "this node can be handed out as a
//! unit". Bit 63 is never used.

/// Number of tree levels (root at level 0, leaves at `LEVELS - 1`).
pub(crate) const LEVELS: usize = 6;
/// Leaf slots per block.
pub(crate) const LEAVES: usize = 1 << (LEVELS - 1);
/// Tree nodes per block.
pub(crate) const NODES: usize = (1 << LEVELS) - 1;
/// Level holding the leaves.
pub(crate) const LEAF_LEVEL: usize = LEVELS - 1;

/// `mips` of a block with nothing allocated: every node is available.
pub(crate) const EMPTY_MIPS: u64 = (1u64 << NODES) - 1;

const _: () = assert!(NODES < 64);
const _: () = assert!(LEAVES == 32);

/// First bit of `level`.
#[inline]
pub(crate) const fn first_bit(level: usize) -> usize {
    (1 << level) - 1
}

/// Level of node `bit`.
#[inline]
pub(crate) const fn level_of(bit: usize) -> usize {
    (usize::BITS - 1 - (bit + 1).leading_zeros()) as usize
}

#[inline]
pub(crate) const fn parent(bit: usize) -> usize {
    (bit - 1) / 2
}

#[inline]
pub(crate) const fn sibling(bit: usize) -> usize {
    if bit % 2 == 1 { bit + 1 } else { bit - 1 }
}

#[inline]
pub(crate) const fn left_child(bit: usize) -> usize {
    2 * bit + 1
}

/// First leaf (0..32) covered by node `bit`.
#[inline]
pub(crate) const fn first_leaf(bit: usize) -> usize {
    let level = level_of(bit);
    (bit - first_bit(level)) << (LEAF_LEVEL - level)
}

/// Number of leaves covered by a node at `level`.
#[inline]
pub(crate) const fn leaves_at(level: usize) -> usize {
    1 << (LEAF_LEVEL - level)
}

/// Node at `level` whose leaf range starts at `leaf`, if `leaf` is aligned
/// to that level.
#[inline]
pub(crate) const fn node_at(level: usize, leaf: usize) -> Option<usize> {
    let span = leaves_at(level);
    if leaf % span != 0 || leaf >= LEAVES {
        return None;
    }
    Some(first_bit(level) + leaf / span)
}

const fn subtree_mask(bit: usize) -> u64 {
    // The node itself plus every descendant, level by level.
    let mut mask = 0u64;
    let mut lo = bit;
    let mut width = 1;
    while lo < NODES {
        let mut i = 0;
        while i < width {
            mask |= 1 << (lo + i);
            i += 1;
        }
        lo = left_child(lo);
        width *= 2;
    }
    mask
}

const fn ancestor_mask(bit: usize) -> u64 {
    let mut mask = 0u64;
    let mut node = bit;
    while node != 0 {
        node = parent(node);
        mask |= 1 << node;
    }
    mask
}

const fn build_level_masks() -> [u64; LEVELS] {
    let mut out = [0u64; LEVELS];
    let mut level = 0;
    while level < LEVELS {
        out[level] = ((1u64 << (1 << level)) - 1) << first_bit(level);
        level += 1;
    }
    out
}

const fn build_set_masks() -> [u64; NODES] {
    let mut out = [0u64; NODES];
    let mut bit = 0;
    while bit < NODES {
        out[bit] = !(subtree_mask(bit) | ancestor_mask(bit));
        bit += 1;
    }
    out
}

const fn build_unset_masks() -> [u64; NODES] {
    let mut out = [0u64; NODES];
    let mut bit = 0;
    while bit < NODES {
        out[bit] = subtree_mask(bit);
        bit += 1;
    }
    out
}

const fn build_size_masks() -> [u64; LEAVES] {
    let mut out = [0u64; LEAVES];
    let mut leaf = 0;
    while leaf < LEAVES {
        let bit = first_bit(LEAF_LEVEL) + leaf;
        out[leaf] = ancestor_mask(bit) | (1 << bit);
        leaf += 1;
    }
    out
}

/// Every node bit of a level.
pub(crate) static LEVEL_MASKS: [u64; LEVELS] = build_level_masks();
/// AND-mask applied to `mips` when a node is claimed: clears the node, its
/// ancestors and all of its descendants in one step.
pub(crate) static SET_MASKS: [u64; NODES] = build_set_masks();
/// OR-mask applied to `mips` when a node is released: the node and its whole
/// subtree become available again.
pub(crate) static UNSET_MASKS: [u64; NODES] = build_unset_masks();
/// Ancestor chain (inclusive) of each leaf. `size & SIZE_MASKS[leaf]` isolates
/// the one live allocation covering that leaf.
pub(crate) static SIZE_MASKS: [u64; LEAVES] = build_size_masks();
