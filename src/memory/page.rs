//! A page: one span-aligned reservation divided into up to 64 buddy blocks.
//!
//! Blocks are committed lazily, one at a time, as allocations need them and
//! decommitted from the top down by [`Page::garbage_collect`]. Allocation and
//! free are lock-free on the block words; only block growth takes the page's
//! growth barrier.
//!
//! Page slots live inside a [`PagePool`] and are recycled between allocators.
//! Ownership is expressed by two handles: [`FreePage`] (slot with no address
//! space, owned by the pool free-list or a caller between pool and allocator)
//! and [`OwnedPage`] (slot with address space, owned by exactly one
//! allocator).

use super::bit_tree::{self, EMPTY_MIPS, LEAF_LEVEL, LEAVES};
use super::block::{Block, Transition, Uncontended};
use super::page_pool::PagePool;
use super::stats::MemoryTracker;
use super::vm::{VmError, VmOps};
use crate::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Backoff, SpinLock};
use std::fmt;
use std::ptr::NonNull;

/// Upper bound on blocks per page (one bit each in the live set).
pub(crate) const MAX_BLOCKS: usize = 64;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Slot layout shared by every page of one allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    leaf_shift: u32,
    max_blocks: usize,
}

impl Geometry {
    pub fn new(leaf_size: usize, max_blocks: usize) -> Self {
        debug_assert!(leaf_size.is_power_of_two());
        debug_assert!((1..=MAX_BLOCKS).contains(&max_blocks));
        Self {
            leaf_shift: leaf_size.trailing_zeros(),
            max_blocks,
        }
    }

    #[inline]
    pub fn leaf_size(self) -> usize {
        1 << self.leaf_shift
    }

    #[inline]
    pub fn block_size(self) -> usize {
        self.leaf_size() * LEAVES
    }

    #[inline]
    pub fn max_blocks(self) -> usize {
        self.max_blocks
    }

    /// Bytes of a fully grown page.
    #[inline]
    pub fn span(self) -> usize {
        self.block_size() * self.max_blocks
    }

    /// Alignment of every page base; a power of two at least `span`.
    #[inline]
    pub fn span_align(self) -> usize {
        self.span().next_power_of_two()
    }

    #[inline]
    pub fn span_shift(self) -> u32 {
        self.span_align().trailing_zeros()
    }

    #[inline]
    pub fn node_size(self, level: usize) -> usize {
        self.block_size() >> level
    }

    /// Tree level serving exactly `bytes`, if it is a slot size.
    pub fn level_for(self, bytes: usize) -> Option<usize> {
        if !bytes.is_power_of_two() || bytes < self.leaf_size() || bytes > self.block_size() {
            return None;
        }
        let doublings = (bytes >> self.leaf_shift).trailing_zeros() as usize;
        Some(LEAF_LEVEL - doublings)
    }

    /// Smallest slot size holding `bytes`.
    pub fn snap(self, bytes: usize) -> Option<usize> {
        if bytes > self.block_size() {
            return None;
        }
        Some(bytes.max(self.leaf_size()).next_power_of_two())
    }

    #[inline]
    pub fn address_of(self, base: usize, block: usize, bit: usize) -> usize {
        let level = bit_tree::level_of(bit);
        base + block * self.block_size()
            + (bit - bit_tree::first_bit(level)) * self.node_size(level)
    }

    /// `(block, leaf)` of a leaf-aligned address inside the span.
    pub fn locate(self, base: usize, addr: usize) -> Option<(usize, usize)> {
        let offset = addr.checked_sub(base)?;
        if offset >= self.span() || offset & (self.leaf_size() - 1) != 0 {
            return None;
        }
        let block = offset / self.block_size();
        let leaf = (offset % self.block_size()) >> self.leaf_shift;
        Some((block, leaf))
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Snapshot of one page, reported by `Allocator::for_each_page`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub base: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    pub max_blocks: usize,
    pub committed_bytes: usize,
    pub allocated_bytes: usize,
    pub live_allocations: usize,
    pub unused_blocks: usize,
}

/// Snapshot of one committed block, reported by `Allocator::for_each_block`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub page_base: usize,
    pub index: usize,
    pub base: usize,
    pub mips: u64,
    pub size: u64,
    pub allocations: usize,
    pub allocated_bytes: usize,
    /// Largest slot that could be claimed right now (0 when full).
    pub largest_free: usize,
}

/// Inconsistency found by `Allocator::validate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SanityError {
    pub page: usize,
    pub block: Option<usize>,
    pub detail: String,
}

impl fmt::Display for SanityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(block) => write!(f, "page {:#x} block {block}: {}", self.page, self.detail),
            None => write!(f, "page {:#x}: {}", self.page, self.detail),
        }
    }
}

impl std::error::Error for SanityError {}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageState {
    Free = 0,
    Owned = 1,
    GcQueued = 2,
}

impl PageState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PageState::Free,
            1 => PageState::Owned,
            _ => PageState::GcQueued,
        }
    }
}

/// Result of a successful [`Page::allocate`].
#[derive(Debug)]
pub(crate) struct Allocation {
    pub ptr: NonNull<u8>,
    pub block: usize,
    /// The page went from zero to one live allocation.
    pub revived: bool,
}

/// Result of a successful [`Page::free`].
#[derive(Debug)]
pub(crate) struct Release {
    pub bytes: usize,
    /// The page went from one to zero live allocations.
    pub page_unused: bool,
}

enum Growth {
    Added(usize),
    Raced,
    Exhausted,
}

pub(crate) struct Page {
    blocks: [Block; MAX_BLOCKS],
    base: AtomicUsize,
    reservation: AtomicUsize,
    reservation_len: AtomicUsize,
    leaf_shift: AtomicU32,
    max_blocks: AtomicUsize,
    /// Committed prefix of `blocks`.
    num_blocks: AtomicUsize,
    /// Bit per block that may still have room. Stale bits only cost a probe.
    live_set: AtomicU64,
    /// Committed blocks with nothing allocated.
    num_unused: AtomicUsize,
    live_allocs: AtomicUsize,
    growth_barrier: SpinLock,
    /// Next free slot index + 1 while on the pool free-list.
    pool_next: AtomicU32,
    /// Next page while on an allocator's GC list.
    gc_next: AtomicPtr<Page>,
    state: AtomicU8,
    pool: NonNull<PagePool>,
    index: u32,
}

// Safety: all mutable state is atomic; `pool` and `index` are immutable.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub(super) fn vacant(pool: NonNull<PagePool>, index: u32) -> Self {
        Self {
            blocks: std::array::from_fn(|_| Block::new()),
            base: AtomicUsize::new(0),
            reservation: AtomicUsize::new(0),
            reservation_len: AtomicUsize::new(0),
            leaf_shift: AtomicU32::new(0),
            max_blocks: AtomicUsize::new(0),
            num_blocks: AtomicUsize::new(0),
            live_set: AtomicU64::new(0),
            num_unused: AtomicUsize::new(0),
            live_allocs: AtomicUsize::new(0),
            growth_barrier: SpinLock::new(),
            pool_next: AtomicU32::new(0),
            gc_next: AtomicPtr::new(std::ptr::null_mut()),
            state: AtomicU8::new(PageState::Free as u8),
            pool,
            index,
        }
    }

    #[inline]
    pub fn pool(&self) -> NonNull<PagePool> {
        self.pool
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            leaf_shift: self.leaf_shift.load(Ordering::Relaxed),
            max_blocks: self.max_blocks.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks.load(Ordering::Acquire)
    }

    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.live_allocs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn unused_blocks(&self) -> usize {
        self.num_unused.load(Ordering::Relaxed)
    }

    /// Is `addr` inside this page's span?
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base();
        base != 0 && addr.wrapping_sub(base) < self.geometry().span()
    }

    pub(super) fn pool_next(&self) -> u32 {
        self.pool_next.load(Ordering::Relaxed)
    }

    pub(super) fn set_pool_next(&self, next: u32) {
        self.pool_next.store(next, Ordering::Relaxed);
    }

    // -- allocation ---------------------------------------------------------

    /// Claim a slot of exactly `bytes` (a slot size of this page's geometry).
    ///
    /// Probing starts at `block_hint`. Block growth commits memory through
    /// `vm`; the committed bytes are reported to `tracker`.
    pub fn allocate<V: VmOps + ?Sized>(
        &self,
        vm: &V,
        block_hint: usize,
        bytes: usize,
        tracker: &dyn MemoryTracker,
    ) -> Option<Allocation> {
        let geo = self.geometry();
        let Some(level) = geo.level_for(bytes) else {
            debug_assert!(false, "{bytes} bytes is not a slot size of this page");
            return None;
        };
        let base = self.base();
        let mut hint = block_hint;
        loop {
            let observed = self.num_blocks.load(Ordering::Acquire);
            if let Some((block, bit)) = self.search(observed, hint, level) {
                let revived = self.live_allocs.fetch_add(1, Ordering::AcqRel) == 0;
                let ptr = NonNull::new(geo.address_of(base, block, bit) as *mut u8)?;
                return Some(Allocation {
                    ptr,
                    block,
                    revived,
                });
            }
            match self.grow(vm, observed, tracker) {
                Growth::Added(block) => hint = block,
                Growth::Raced => {}
                Growth::Exhausted => return None,
            }
        }
    }

    fn search(&self, observed: usize, hint: usize, level: usize) -> Option<(usize, usize)> {
        let live = self.live_set.load(Ordering::Acquire);
        if observed == 0 || live == 0 {
            return None;
        }
        for i in 0..observed {
            let block = (hint + i) % observed;
            if live & (1 << block) == 0 {
                continue;
            }
            let b = &self.blocks[block];
            if let Some((bit, transition)) = b.try_claim(level, &Uncontended) {
                b.mark_size(bit);
                self.note_claim(block, transition);
                return Some((block, bit));
            }
        }
        None
    }

    /// Commit the next block, unless another thread already did.
    fn grow<V: VmOps + ?Sized>(
        &self,
        vm: &V,
        observed: usize,
        tracker: &dyn MemoryTracker,
    ) -> Growth {
        let geo = self.geometry();
        if observed >= geo.max_blocks() {
            return Growth::Exhausted;
        }
        let _guard = self.growth_barrier.lock();
        let n = self.num_blocks.load(Ordering::Acquire);
        if n != observed {
            return Growth::Raced;
        }

        let block_size = geo.block_size();
        let base = self.base();
        let Some(ptr) = NonNull::new((base + n * block_size) as *mut u8) else {
            return Growth::Exhausted;
        };
        // Safety: block `n` lies inside this page's reservation and is page
        // aligned because the block size is a multiple of the OS page size.
        if let Err(e) = unsafe { vm.commit(ptr, block_size) } {
            log::warn!("page {base:#x}: committing block {n} failed: {e}");
            return Growth::Exhausted;
        }
        tracker.allocate_system(block_size);

        self.blocks[n].reset();
        self.num_unused.fetch_add(1, Ordering::Relaxed);
        self.live_set.fetch_or(1 << n, Ordering::Release);
        self.num_blocks.store(n + 1, Ordering::Release);
        log::trace!("page {base:#x}: committed block {n}");
        Growth::Added(n)
    }

    fn note_claim(&self, block: usize, t: Transition) {
        if t.left_empty() {
            self.num_unused.fetch_sub(1, Ordering::Relaxed);
        }
        if t.became_full() {
            let bit = 1u64 << block;
            self.live_set.fetch_and(!bit, Ordering::AcqRel);
            // A release may have landed between our claim and the clear.
            if self.blocks[block].mips() != 0 {
                self.live_set.fetch_or(bit, Ordering::AcqRel);
            }
        }
    }

    fn note_release(&self, block: usize, t: Transition) {
        if t.left_full() {
            self.live_set.fetch_or(1 << block, Ordering::AcqRel);
        }
        if t.became_empty() {
            self.num_unused.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Block and live node of an allocation start pointer.
    fn resolve(&self, ptr: NonNull<u8>) -> Option<(usize, usize)> {
        let geo = self.geometry();
        let (block, leaf) = geo.locate(self.base(), ptr.as_ptr() as usize)?;
        if block >= self.num_blocks() {
            return None;
        }
        let bit = self.blocks[block].allocated_node(leaf)?;
        (bit_tree::first_leaf(bit) == leaf).then_some((block, bit))
    }

    /// Release the allocation starting at `ptr`.
    ///
    /// Returns `None` (and asserts in debug builds) for a pointer that is not
    /// a live allocation start in this page.
    pub fn free(&self, ptr: NonNull<u8>) -> Option<Release> {
        let Some((block, bit)) = self.resolve(ptr) else {
            debug_assert!(false, "pointer {ptr:p} is not a live allocation of page {:#x}", self.base());
            return None;
        };
        let b = &self.blocks[block];
        if !b.clear_size(bit) {
            debug_assert!(false, "double free of {ptr:p}");
            return None;
        }
        let transition = b.try_merge(bit, &Uncontended);
        self.note_release(block, transition);

        let bytes = self.geometry().node_size(bit_tree::level_of(bit));
        let page_unused = self.live_allocs.fetch_sub(1, Ordering::AcqRel) == 1;
        Some(Release { bytes, page_unused })
    }

    /// Slot size of the live allocation starting at `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let (_, bit) = self.resolve(ptr)?;
        Some(self.geometry().node_size(bit_tree::level_of(bit)))
    }

    /// Resize the allocation at `ptr` in place to `bytes` (a slot size).
    ///
    /// Returns the old slot size, or `None` if growing would need neighbours
    /// that are in use. The allocation is untouched on failure.
    pub fn resize(&self, ptr: NonNull<u8>, bytes: usize) -> Option<usize> {
        let geo = self.geometry();
        let Some(level) = geo.level_for(bytes) else {
            debug_assert!(false, "{bytes} bytes is not a slot size of this page");
            return None;
        };
        let Some((block, bit)) = self.resolve(ptr) else {
            debug_assert!(false, "pointer {ptr:p} is not a live allocation of page {:#x}", self.base());
            return None;
        };
        let current = bit_tree::level_of(bit);
        let old = geo.node_size(current);
        if level == current {
            return Some(old);
        }

        let b = &self.blocks[block];
        if !b.clear_size(bit) {
            debug_assert!(false, "resize raced with a free of {ptr:p}");
            return None;
        }
        if level < current {
            match b.try_grow(bit, level, &Uncontended) {
                Some((node, transition)) => {
                    b.mark_size(node);
                    self.note_claim(block, transition);
                }
                None => {
                    b.mark_size(bit);
                    return None;
                }
            }
        } else {
            let (node, transition) = b.try_shrink(bit, level, &Uncontended);
            b.mark_size(node);
            self.note_release(block, transition);
        }
        Some(old)
    }

    // -- reclamation ----------------------------------------------------------

    /// Decommit trailing empty blocks. Returns the bytes decommitted.
    ///
    /// # Safety
    /// No allocate, free or resize may run on this page concurrently (the
    /// owning allocator's writer lock must be held).
    pub unsafe fn garbage_collect<V: VmOps + ?Sized>(
        &self,
        vm: &V,
        tracker: &dyn MemoryTracker,
    ) -> usize {
        let geo = self.geometry();
        let block_size = geo.block_size();
        let base = self.base();
        let mut n = self.num_blocks();
        let mut released = 0;
        while n > 0 {
            let top = n - 1;
            if !self.blocks[top].is_empty() {
                break;
            }
            let Some(ptr) = NonNull::new((base + top * block_size) as *mut u8) else {
                break;
            };
            // Safety: block `top` is committed, empty, and nobody else touches
            // this page while the caller holds exclusive access.
            if let Err(e) = unsafe { vm.decommit(ptr, block_size) } {
                log::error!("page {base:#x}: decommitting block {top} failed: {e}");
                break;
            }
            tracker.deallocate_system(block_size);
            self.blocks[top].retire();
            self.live_set.fetch_and(!(1 << top), Ordering::AcqRel);
            self.num_unused.fetch_sub(1, Ordering::Relaxed);
            self.num_blocks.store(top, Ordering::Release);
            released += block_size;
            n = top;
        }
        if released > 0 {
            log::debug!("page {base:#x}: decommitted {released} bytes, {n} blocks remain");
        }
        released
    }

    /// Queue this page on an allocator's GC list. Returns false if it is
    /// already queued.
    pub fn try_enqueue_gc(&self, head: &AtomicPtr<Page>) -> bool {
        if self
            .state
            .compare_exchange(
                PageState::Owned as u8,
                PageState::GcQueued as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let me = std::ptr::from_ref(self).cast_mut();
        let mut backoff = Backoff::new();
        let mut current = head.load(Ordering::Relaxed);
        loop {
            self.gc_next.store(current, Ordering::Relaxed);
            match head.compare_exchange_weak(current, me, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => {
                    current = actual;
                    backoff.snooze();
                }
            }
        }
    }

    // -- diagnostics ----------------------------------------------------------

    pub fn info(&self) -> PageInfo {
        let geo = self.geometry();
        let num_blocks = self.num_blocks();
        let allocated_leaves: usize = self.blocks[..num_blocks]
            .iter()
            .map(Block::allocated_leaves)
            .sum();
        PageInfo {
            base: self.base(),
            block_size: geo.block_size(),
            num_blocks,
            max_blocks: geo.max_blocks(),
            committed_bytes: num_blocks * geo.block_size(),
            allocated_bytes: allocated_leaves * geo.leaf_size(),
            live_allocations: self.live_allocations(),
            unused_blocks: self.unused_blocks(),
        }
    }

    pub fn for_each_block(&self, mut f: impl FnMut(&BlockInfo)) {
        let geo = self.geometry();
        let base = self.base();
        for (index, b) in self.blocks[..self.num_blocks()].iter().enumerate() {
            let size = b.size_bits();
            let info = BlockInfo {
                page_base: base,
                index,
                base: base + index * geo.block_size(),
                mips: b.mips(),
                size,
                allocations: size.count_ones() as usize,
                allocated_bytes: b.allocated_leaves() * geo.leaf_size(),
                largest_free: b.largest_free_level().map_or(0, |level| geo.node_size(level)),
            };
            f(&info);
        }
    }

    /// Cross-check every committed block and the page counters.
    ///
    /// Only meaningful while no operation is in flight on this page.
    pub fn validate(&self) -> Result<(), SanityError> {
        let base = self.base();
        let err = |block: Option<usize>, detail: String| SanityError {
            page: base,
            block,
            detail,
        };
        let geo = self.geometry();
        let n = self.num_blocks();
        if n > geo.max_blocks() {
            return Err(err(None, format!("{n} blocks committed, limit {}", geo.max_blocks())));
        }

        let live = self.live_set.load(Ordering::Acquire);
        let mut allocations = 0;
        let mut unused = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            let in_live_set = live & (1 << i) != 0;
            if i >= n {
                if in_live_set || b.mips() != 0 || b.size_bits() != 0 {
                    return Err(err(Some(i), "uncommitted block has state".into()));
                }
                continue;
            }
            b.validate().map_err(|detail| err(Some(i), detail))?;
            if in_live_set != (b.mips() != 0) {
                return Err(err(
                    Some(i),
                    format!("live-set bit {in_live_set} but mips {:#018x}", b.mips()),
                ));
            }
            allocations += b.size_bits().count_ones() as usize;
            if b.mips() == EMPTY_MIPS {
                unused += 1;
            }
        }

        if allocations != self.live_allocations() {
            return Err(err(
                None,
                format!("{allocations} size bits but {} live allocations", self.live_allocations()),
            ));
        }
        if unused != self.unused_blocks() {
            return Err(err(
                None,
                format!("{unused} empty blocks but counter says {}", self.unused_blocks()),
            ));
        }
        Ok(())
    }
}

/// Take every page off a GC list, marking each `Owned` again.
///
/// # Safety
/// Every page on the list must still be owned by the caller's allocator, and
/// no other thread may drain the same list concurrently.
pub(crate) unsafe fn drain_gc_list(head: &AtomicPtr<Page>, mut f: impl FnMut(NonNull<Page>)) {
    let mut current = head.swap(std::ptr::null_mut(), Ordering::Acquire);
    while let Some(page) = NonNull::new(current) {
        // Safety: queued pages stay alive while their allocator owns them.
        let p = unsafe { page.as_ref() };
        current = p.gc_next.swap(std::ptr::null_mut(), Ordering::Relaxed);
        p.state.store(PageState::Owned as u8, Ordering::Release);
        f(page);
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A page slot with no address space.
#[derive(Debug)]
pub(crate) struct FreePage(NonNull<Page>);

// Safety: the handle is the only owner of the slot.
unsafe impl Send for FreePage {}

impl FreePage {
    /// # Safety
    /// `page` must be an initialized slot in the `Free` state that nobody
    /// else holds a handle to.
    pub(super) unsafe fn from_raw(page: NonNull<Page>) -> Self {
        Self(page)
    }

    pub(super) fn into_raw(self) -> NonNull<Page> {
        self.0
    }

    #[inline]
    pub fn pool(&self) -> NonNull<PagePool> {
        // Safety: slot is live while its pool is.
        unsafe { self.0.as_ref() }.pool()
    }

    /// Reserve a span-aligned window for `geo` and hand the page to an
    /// allocator. On failure the slot is returned with the error.
    pub fn assign<V: VmOps + ?Sized>(
        self,
        vm: &V,
        geo: Geometry,
    ) -> Result<OwnedPage, (FreePage, VmError)> {
        let ptr = self.0;
        // Safety: slot is live and exclusively ours.
        let page = unsafe { ptr.as_ref() };
        debug_assert_eq!(page.state(), PageState::Free);

        let align = geo.span_align();
        let len = geo.span() + align - vm.page_size().min(align);
        // Safety: `len` is non-zero.
        let reservation = match unsafe { vm.reserve(len) } {
            Ok(r) => r,
            Err(e) => return Err((self, e)),
        };
        let start = reservation.as_ptr() as usize;
        let base = start.next_multiple_of(align);

        page.reservation.store(start, Ordering::Relaxed);
        page.reservation_len.store(len, Ordering::Relaxed);
        page.base.store(base, Ordering::Relaxed);
        page.leaf_shift.store(geo.leaf_shift, Ordering::Relaxed);
        page.max_blocks.store(geo.max_blocks, Ordering::Relaxed);
        page.num_blocks.store(0, Ordering::Relaxed);
        page.live_set.store(0, Ordering::Relaxed);
        page.num_unused.store(0, Ordering::Relaxed);
        page.live_allocs.store(0, Ordering::Relaxed);
        page.gc_next.store(std::ptr::null_mut(), Ordering::Relaxed);
        page.state.store(PageState::Owned as u8, Ordering::Release);
        log::trace!("page slot {}: reserved {len} bytes, base {base:#x}", page.index());
        Ok(OwnedPage(ptr))
    }
}

/// A page with address space, owned by one allocator.
#[derive(Debug)]
pub(crate) struct OwnedPage(NonNull<Page>);

// Safety: page state is atomic; the handle is the single owner.
unsafe impl Send for OwnedPage {}
unsafe impl Sync for OwnedPage {}

impl OwnedPage {
    #[inline]
    pub fn as_ptr(&self) -> NonNull<Page> {
        self.0
    }

    /// Release the address space (discarding any live allocations) and turn
    /// the page back into a bare slot.
    pub fn into_free<V: VmOps + ?Sized>(self, vm: &V, tracker: &dyn MemoryTracker) -> FreePage {
        let ptr = self.0;
        // Safety: slot is live; ownership moves with `self`.
        let page = unsafe { ptr.as_ref() };
        debug_assert_ne!(page.state(), PageState::GcQueued, "page still on a GC list");

        let committed = page.num_blocks.swap(0, Ordering::AcqRel);
        tracker.deallocate_system(committed * page.geometry().block_size());
        for b in &page.blocks[..committed] {
            b.discard();
        }

        let start = page.reservation.swap(0, Ordering::Relaxed);
        let len = page.reservation_len.swap(0, Ordering::Relaxed);
        if let Some(reservation) = NonNull::new(start as *mut u8) {
            // Safety: exactly the range reserved by `assign`.
            if let Err(e) = unsafe { vm.release(reservation, len) } {
                log::error!("page slot {}: releasing {len} bytes failed: {e}", page.index());
            }
        }
        page.base.store(0, Ordering::Relaxed);
        page.live_set.store(0, Ordering::Relaxed);
        page.num_unused.store(0, Ordering::Relaxed);
        page.live_allocs.store(0, Ordering::Relaxed);
        page.state.store(PageState::Free as u8, Ordering::Release);
        FreePage(ptr)
    }
}

impl std::ops::Deref for OwnedPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        // Safety: the slot outlives the handle (its pool is only destroyed
        // once every page is back).
        unsafe { self.0.as_ref() }
    }
}
