use super::bit_tree::{
    self, EMPTY_MIPS, LEAVES, LEVEL_MASKS, NODES, SET_MASKS, SIZE_MASKS, UNSET_MASKS,
};
use crate::sync::Backoff;
use crate::sync::atomic::{AtomicU64, Ordering};
use fixedbitset::FixedBitSet;

/// Interference hook called between reading a block word and the
/// compare-exchange that publishes the new value.
///
/// Production code uses [`Uncontended`]; tests inject hooks that modify the
/// word to force the retry paths.
pub(crate) trait Contention {
    #[inline]
    fn before_exchange(&self, _word: &AtomicU64) {}
}

pub(crate) struct Uncontended;

impl Contention for Uncontended {}

/// `mips` before and after a successful update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub old: u64,
    pub new: u64,
}

impl Transition {
    #[inline]
    pub fn became_full(self) -> bool {
        self.old != 0 && self.new == 0
    }

    #[inline]
    pub fn left_full(self) -> bool {
        self.old == 0 && self.new != 0
    }

    #[inline]
    pub fn became_empty(self) -> bool {
        self.old != EMPTY_MIPS && self.new == EMPTY_MIPS
    }

    #[inline]
    pub fn left_empty(self) -> bool {
        self.old == EMPTY_MIPS && self.new != EMPTY_MIPS
    }
}

/// One 32-leaf buddy tree: availability (`mips`) and live-node markers
/// (`size`). An uncommitted block has `mips == 0`, so nothing can be claimed
/// from it.
#[repr(C, align(16))]
pub(crate) struct Block {
    mips: AtomicU64,
    size: AtomicU64,
}

impl Block {
    pub fn new() -> Self {
        Self {
            mips: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }

    /// Freshly committed: everything available.
    pub fn reset(&self) {
        self.size.store(0, Ordering::Relaxed);
        self.mips.store(EMPTY_MIPS, Ordering::Release);
    }

    /// About to be decommitted: nothing available.
    pub fn retire(&self) {
        debug_assert_eq!(self.size.load(Ordering::Relaxed), 0);
        self.mips.store(0, Ordering::Release);
    }

    /// Address space is being released; live allocations are discarded.
    pub fn discard(&self) {
        self.size.store(0, Ordering::Relaxed);
        self.mips.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn mips(&self) -> u64 {
        self.mips.load(Ordering::Acquire)
    }

    #[inline]
    pub fn size_bits(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mips() == EMPTY_MIPS
    }

    /// Claim the lowest available node at `level`.
    ///
    /// Picking the lowest set bit keeps allocations packed toward the start
    /// of the block.
    pub fn try_claim(&self, level: usize, hook: &impl Contention) -> Option<(usize, Transition)> {
        let mut backoff = Backoff::new();
        let mut mips = self.mips.load(Ordering::Acquire);
        loop {
            let avail = mips & LEVEL_MASKS[level];
            if avail == 0 {
                return None;
            }
            let bit = avail.trailing_zeros() as usize;
            let new = mips & SET_MASKS[bit];
            hook.before_exchange(&self.mips);
            match self
                .mips
                .compare_exchange_weak(mips, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((bit, Transition { old: mips, new })),
                Err(actual) => {
                    mips = actual;
                    backoff.snooze();
                }
            }
        }
    }

    /// Release node `bit` and coalesce upward while the sibling subtree is
    /// fully available.
    pub fn try_merge(&self, bit: usize, hook: &impl Contention) -> Transition {
        let mut backoff = Backoff::new();
        let mut mips = self.mips.load(Ordering::Acquire);
        loop {
            debug_assert_eq!(mips & (1 << bit), 0, "node {bit} is already available");
            let mut new = mips | UNSET_MASKS[bit];
            let mut node = bit;
            while node != 0 && new & (1 << bit_tree::sibling(node)) != 0 {
                node = bit_tree::parent(node);
                new |= 1 << node;
            }
            hook.before_exchange(&self.mips);
            match self
                .mips
                .compare_exchange_weak(mips, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Transition { old: mips, new },
                Err(actual) => {
                    mips = actual;
                    backoff.snooze();
                }
            }
        }
    }

    /// Widen the live node `from` to its ancestor at `level`, keeping the
    /// same first leaf. Fails unless every buddy between them is available.
    pub fn try_grow(
        &self,
        from: usize,
        level: usize,
        hook: &impl Contention,
    ) -> Option<(usize, Transition)> {
        debug_assert!(level < bit_tree::level_of(from));
        let mut needed = 0u64;
        let mut target = from;
        while bit_tree::level_of(target) > level {
            needed |= 1 << bit_tree::sibling(target);
            target = bit_tree::parent(target);
        }
        if bit_tree::first_leaf(target) != bit_tree::first_leaf(from) {
            return None;
        }

        let mut backoff = Backoff::new();
        let mut mips = self.mips.load(Ordering::Acquire);
        loop {
            if mips & needed != needed {
                return None;
            }
            let new = mips & SET_MASKS[target];
            hook.before_exchange(&self.mips);
            match self
                .mips
                .compare_exchange_weak(mips, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((target, Transition { old: mips, new })),
                Err(actual) => {
                    mips = actual;
                    backoff.snooze();
                }
            }
        }
    }

    /// Narrow the live node `from` to its left-most descendant at `level`;
    /// the rest of its subtree becomes available. Always succeeds.
    pub fn try_shrink(&self, from: usize, level: usize, hook: &impl Contention) -> (usize, Transition) {
        debug_assert!(level > bit_tree::level_of(from));
        let mut target = from;
        while bit_tree::level_of(target) < level {
            target = bit_tree::left_child(target);
        }

        let mut backoff = Backoff::new();
        let mut mips = self.mips.load(Ordering::Acquire);
        loop {
            let new = (mips | UNSET_MASKS[from]) & SET_MASKS[target];
            hook.before_exchange(&self.mips);
            match self
                .mips
                .compare_exchange_weak(mips, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (target, Transition { old: mips, new }),
                Err(actual) => {
                    mips = actual;
                    backoff.snooze();
                }
            }
        }
    }

    #[inline]
    pub fn mark_size(&self, bit: usize) {
        let old = self.size.fetch_or(1 << bit, Ordering::Release);
        debug_assert_eq!(old & (1 << bit), 0, "size bit {bit} set twice");
    }

    /// Returns false if the bit was not set (double free).
    #[inline]
    pub fn clear_size(&self, bit: usize) -> bool {
        let old = self.size.fetch_and(!(1 << bit), Ordering::AcqRel);
        old & (1 << bit) != 0
    }

    /// The live node covering `leaf`, if any.
    #[inline]
    pub fn allocated_node(&self, leaf: usize) -> Option<usize> {
        let hit = self.size.load(Ordering::Acquire) & SIZE_MASKS[leaf];
        if hit == 0 {
            return None;
        }
        debug_assert_eq!(hit.count_ones(), 1, "overlapping size bits for leaf {leaf}");
        Some(hit.trailing_zeros() as usize)
    }

    /// Leaves covered by live allocations.
    pub fn allocated_leaves(&self) -> usize {
        leaves_of(self.size_bits())
    }

    /// Shallowest level with an available node (largest free slot).
    pub fn largest_free_level(&self) -> Option<usize> {
        let mips = self.mips();
        LEVEL_MASKS.iter().position(|&mask| mips & mask != 0)
    }

    /// Rebuild the `mips` word implied by `size` and compare.
    ///
    /// Only meaningful while no operation is in flight on this block.
    pub fn validate(&self) -> Result<(), String> {
        let size = self.size_bits();
        let mips = self.mips();

        let mut covered = FixedBitSet::with_capacity(LEAVES);
        for bit in set_bits(size) {
            if bit >= NODES {
                return Err(format!("size bit {bit} is outside the tree"));
            }
            let first = bit_tree::first_leaf(bit);
            let count = bit_tree::leaves_at(bit_tree::level_of(bit));
            for leaf in first..first + count {
                if covered.put(leaf) {
                    return Err(format!("leaf {leaf} is covered by two live allocations"));
                }
            }
        }

        let mut expected = 0u64;
        for bit in 0..NODES {
            let first = bit_tree::first_leaf(bit);
            let count = bit_tree::leaves_at(bit_tree::level_of(bit));
            if (first..first + count).all(|leaf| !covered.contains(leaf)) {
                expected |= 1 << bit;
            }
        }

        if expected != mips {
            return Err(format!(
                "mips {mips:#018x} disagrees with size {size:#018x} (expected {expected:#018x})"
            ));
        }
        Ok(())
    }
}

/// Iterate the indices of the set bits of `word`, lowest first.
pub(crate) fn set_bits(mut word: u64) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if word == 0 {
            return None;
        }
        let bit = word.trailing_zeros() as usize;
        word &= word - 1;
        Some(bit)
    })
}

/// Leaves covered by the nodes in a `size` word.
pub(crate) fn leaves_of(size: u64) -> usize {
    set_bits(size)
        .map(|bit| bit_tree::leaves_at(bit_tree::level_of(bit)))
        .sum()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::bit_tree::{LEAF_LEVEL, first_bit};
    use std::cell::Cell;

    fn fresh() -> Block {
        let b = Block::new();
        b.reset();
        b
    }

    /// Performs one foreign update the first time the hook fires.
    struct Interfere<F: Fn(&AtomicU64)> {
        action: F,
        fired: Cell<u32>,
    }

    impl<F: Fn(&AtomicU64)> Interfere<F> {
        fn new(action: F) -> Self {
            Self {
                action,
                fired: Cell::new(0),
            }
        }
    }

    impl<F: Fn(&AtomicU64)> Contention for Interfere<F> {
        fn before_exchange(&self, word: &AtomicU64) {
            self.fired.set(self.fired.get() + 1);
            if self.fired.get() == 1 {
                (self.action)(word);
            }
        }
    }

    fn claim(b: &Block, level: usize) -> usize {
        let (bit, _) = b.try_claim(level, &Uncontended).unwrap();
        b.mark_size(bit);
        bit
    }

    fn release(b: &Block, bit: usize) -> Transition {
        assert!(b.clear_size(bit));
        b.try_merge(bit, &Uncontended)
    }

    #[test]
    fn test_claim_lowest_leaf_first() {
        let b = fresh();
        let first = claim(&b, LEAF_LEVEL);
        let second = claim(&b, LEAF_LEVEL);
        assert_eq!(first, first_bit(LEAF_LEVEL));
        assert_eq!(second, first_bit(LEAF_LEVEL) + 1);
        b.validate().unwrap();
    }

    #[test]
    fn test_claim_all_leaves_then_full() {
        let b = fresh();
        let mut last = None;
        for _ in 0..LEAVES {
            let (bit, t) = b.try_claim(LEAF_LEVEL, &Uncontended).unwrap();
            b.mark_size(bit);
            last = Some(t);
        }
        assert!(last.unwrap().became_full());
        assert!(b.try_claim(LEAF_LEVEL, &Uncontended).is_none());
        assert_eq!(b.allocated_leaves(), LEAVES);
        b.validate().unwrap();
    }

    #[test]
    fn test_root_claim_blocks_leaf_claim() {
        let b = fresh();
        let root = claim(&b, 0);
        assert_eq!(root, 0);
        assert!(b.try_claim(LEAF_LEVEL, &Uncontended).is_none());
        let t = release(&b, root);
        assert!(t.became_empty());
        assert!(b.try_claim(LEAF_LEVEL, &Uncontended).is_some());
    }

    #[test]
    fn test_merge_coalesces_buddies() {
        let b = fresh();
        let l0 = claim(&b, LEAF_LEVEL);
        let l1 = claim(&b, LEAF_LEVEL);
        // While l1 is live its parent stays unavailable.
        let t = release(&b, l0);
        assert_eq!(t.new & (1 << bit_tree::parent(l0)), 0);
        b.validate().unwrap();
        let t = release(&b, l1);
        assert_eq!(t.new, EMPTY_MIPS);
    }

    #[test]
    fn test_claim_retries_after_interference() {
        let b = fresh();
        let leaf0 = first_bit(LEAF_LEVEL);
        // Another "thread" takes leaf 0 between our load and exchange.
        let hook = Interfere::new(|word: &AtomicU64| {
            word.fetch_and(SET_MASKS[leaf0], Ordering::AcqRel);
        });
        let (bit, t) = b.try_claim(LEAF_LEVEL, &hook).unwrap();
        assert_eq!(bit, leaf0 + 1);
        assert_eq!(t.new & (1 << leaf0), 0);
        assert!(hook.fired.get() >= 2);
    }

    #[test]
    fn test_merge_sees_concurrent_sibling_release() {
        let b = fresh();
        let l0 = claim(&b, LEAF_LEVEL);
        let l1 = claim(&b, LEAF_LEVEL);
        assert!(b.clear_size(l0));
        assert!(b.clear_size(l1));
        // The sibling's release lands first, without coalescing (l0 still live).
        let hook = Interfere::new(move |word: &AtomicU64| {
            word.fetch_or(UNSET_MASKS[l1], Ordering::AcqRel);
        });
        let t = b.try_merge(l0, &hook);
        assert_eq!(t.new, EMPTY_MIPS, "retry must coalesce both leaves");
    }

    #[test]
    fn test_grow_requires_free_buddies() {
        let b = fresh();
        let l0 = claim(&b, LEAF_LEVEL);
        // Leaf 0 -> level 3 node (4 leaves): buddies at leaf levels 4 and 3 are free.
        assert!(b.clear_size(l0));
        let (node, _) = b.try_grow(l0, 3, &Uncontended).unwrap();
        b.mark_size(node);
        assert_eq!(bit_tree::level_of(node), 3);
        assert_eq!(bit_tree::first_leaf(node), 0);
        b.validate().unwrap();

        // A live neighbour inside the window makes growing impossible.
        let neighbour = claim(&b, LEAF_LEVEL);
        assert_eq!(bit_tree::first_leaf(neighbour), 4);
        assert!(b.clear_size(node));
        assert!(b.try_grow(node, 1, &Uncontended).is_none());
        b.mark_size(node);
        b.validate().unwrap();
    }

    #[test]
    fn test_grow_rejects_misaligned_window() {
        let b = fresh();
        let _l0 = claim(&b, LEAF_LEVEL);
        let l1 = claim(&b, LEAF_LEVEL);
        // Leaf 1 is not the first leaf of any larger node.
        assert!(b.clear_size(l1));
        assert!(b.try_grow(l1, LEAF_LEVEL - 1, &Uncontended).is_none());
    }

    #[test]
    fn test_shrink_releases_tail() {
        let b = fresh();
        let root = claim(&b, 0);
        assert!(b.clear_size(root));
        let (leaf, t) = b.try_shrink(root, LEAF_LEVEL, &Uncontended);
        b.mark_size(leaf);
        assert!(t.left_full());
        assert_eq!(leaf, first_bit(LEAF_LEVEL));
        assert_eq!(b.allocated_leaves(), 1);
        b.validate().unwrap();
        // The freed half is claimable at level 1.
        let (half, _) = b.try_claim(1, &Uncontended).unwrap();
        assert_eq!(half, 2);
    }

    #[test]
    fn test_validate_detects_mismatch() {
        let b = fresh();
        let _ = claim(&b, LEAF_LEVEL);
        // Leak a mips bit: claim without recording the size.
        let _ = b.try_claim(LEAF_LEVEL, &Uncontended).unwrap();
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_largest_free_level() {
        let b = fresh();
        assert_eq!(b.largest_free_level(), Some(0));
        let _ = claim(&b, LEAF_LEVEL);
        assert_eq!(b.largest_free_level(), Some(1));
        let full = Block::new();
        assert_eq!(full.largest_free_level(), None);
    }

    #[test]
    fn test_set_bits_and_leaves_of() {
        assert_eq!(set_bits(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
        // root (32 leaves) + one leaf
        assert_eq!(leaves_of(1 | (1 << 40)), 33);
    }
}
