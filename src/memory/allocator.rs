//! Concurrent power-of-two sub-allocator over pages from a [`PageCache`].
//!
//! Allocation and free take the reader side of one `RwLock`, so they run in
//! parallel and only contend on block words. The writer side is taken to add
//! a page, to drop one, and to garbage collect. A page that becomes fully
//! unused is pushed onto a lock-free GC list; collection drains it under the
//! writer lock, keeps one empty page warm and hands the rest back to the
//! cache.

use super::page::{self, Geometry, OwnedPage, Page, SanityError};
use super::page_cache::PageCache;
use super::page_trie::PageTrie;
use super::stats::{MemoryTracker, NullTracker};
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::{self, Arc, RwLock};
use std::ptr::NonNull;

pub use super::page::{BlockInfo, PageInfo};

/// Empty pages kept committed before a free triggers collection.
const RETAINED_UNUSED_PAGES: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Smallest slot size. Power of two; 32 leaves make one block.
    pub leaf_size: usize,
    /// Blocks per page, `1..=64`. A page's address window is
    /// `leaf_size * 32 * max_blocks` bytes.
    pub max_blocks: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            leaf_size: 64 * 1024,
            max_blocks: 16,
        }
    }
}

impl AllocatorConfig {
    /// Largest slot size (one whole block).
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.leaf_size.saturating_mul(super::bit_tree::LEAVES)
    }

    fn geometry(&self, os_page_size: usize) -> Result<Geometry, VmError> {
        if !self.leaf_size.is_power_of_two() || self.leaf_size < 16 {
            return Err(VmError::InvalidConfig(format!(
                "leaf_size {} must be a power of two of at least 16",
                self.leaf_size
            )));
        }
        if !(1..=page::MAX_BLOCKS).contains(&self.max_blocks) {
            return Err(VmError::InvalidConfig(format!(
                "max_blocks {} must be in 1..={}",
                self.max_blocks,
                page::MAX_BLOCKS
            )));
        }
        let block = self.block_size();
        if block % os_page_size != 0 {
            return Err(VmError::InvalidConfig(format!(
                "block size {block} is not a multiple of the OS page size {os_page_size}"
            )));
        }
        if block.checked_mul(self.max_blocks).and_then(usize::checked_next_power_of_two).is_none() {
            return Err(VmError::InvalidConfig(format!(
                "{} blocks of {block} bytes overflow the address space",
                self.max_blocks
            )));
        }
        Ok(Geometry::new(self.leaf_size, self.max_blocks))
    }
}

/// Where the caller's last allocation landed. Threads that keep one hint
/// tend to keep allocating from the same page and block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageHint {
    page: usize,
    block: usize,
}

impl PageHint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Totals across every owned page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes handed out in live slots.
    pub allocated: usize,
    /// Committed bytes not covered by a live slot.
    pub available: usize,
    /// Bytes backed by committed blocks.
    pub committed: usize,
    pub allocation_count: usize,
}

struct PageTable {
    trie: PageTrie<NonNull<Page>>,
    /// Probe order for allocation.
    pages: Vec<OwnedPage>,
    /// Empty page kept committed by the last collection.
    retained: Option<NonNull<Page>>,
}

// Safety: the raw page pointers are owned by `pages`; page state is atomic.
unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
    fn remove(&mut self, page: NonNull<Page>) -> Option<OwnedPage> {
        let index = self.pages.iter().position(|p| p.as_ptr() == page)?;
        let owned = self.pages.swap_remove(index);
        self.trie.remove(owned.base());
        if self.retained == Some(page) {
            self.retained = None;
        }
        Some(owned)
    }
}

pub struct Allocator<V: VmOps = PlatformVmOps> {
    cache: Arc<PageCache<V>>,
    geometry: Geometry,
    table: RwLock<PageTable>,
    /// Approximate count of pages with no live allocations.
    unused_pages: AtomicUsize,
    gc_head: AtomicPtr<Page>,
    tracker: Box<dyn MemoryTracker>,
}

#[cfg(not(loom))]
impl Allocator<PlatformVmOps> {
    /// Allocator drawing pages from the process-wide
    /// [`GlobalPageCache`](super::page_cache::GlobalPageCache).
    ///
    /// # Errors
    /// [`VmError::InvalidConfig`] for an invalid `config`.
    pub fn new(config: AllocatorConfig) -> Result<Self, VmError> {
        Self::with_cache(super::page_cache::GlobalPageCache::get(), config)
    }
}

impl<V: VmOps> Allocator<V> {
    /// # Errors
    /// [`VmError::InvalidConfig`] for an invalid `config`.
    pub fn with_cache(cache: Arc<PageCache<V>>, config: AllocatorConfig) -> Result<Self, VmError> {
        Self::with_tracker(cache, config, Box::new(NullTracker))
    }

    /// # Errors
    /// [`VmError::InvalidConfig`] for an invalid `config`.
    pub fn with_tracker(
        cache: Arc<PageCache<V>>,
        config: AllocatorConfig,
        tracker: Box<dyn MemoryTracker>,
    ) -> Result<Self, VmError> {
        let geometry = config.geometry(cache.vm().page_size())?;
        log::debug!(
            "allocator: {} byte leaves, {} byte blocks, {} blocks per page",
            geometry.leaf_size(),
            geometry.block_size(),
            geometry.max_blocks()
        );
        Ok(Self {
            cache,
            geometry,
            table: RwLock::new(PageTable {
                trie: PageTrie::new(geometry.span_shift()),
                pages: Vec::new(),
                retained: None,
            }),
            unused_pages: AtomicUsize::new(0),
            gc_head: AtomicPtr::new(std::ptr::null_mut()),
            tracker,
        })
    }

    #[must_use]
    pub fn config(&self) -> AllocatorConfig {
        AllocatorConfig {
            leaf_size: self.geometry.leaf_size(),
            max_blocks: self.geometry.max_blocks(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache<V>> {
        &self.cache
    }

    /// Round `bytes` up to the slot size that would serve it, or `None` if
    /// it exceeds the block size.
    #[must_use]
    pub fn snap_size(&self, bytes: usize) -> Option<usize> {
        self.geometry.snap(bytes)
    }

    /// Allocate a slot of exactly `bytes`, which must be a size returned by
    /// [`snap_size`](Self::snap_size). Returns `None` when out of memory.
    pub fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let mut hint = PageHint::default();
        self.allocate_hinted(bytes, &mut hint)
    }

    /// Like [`allocate`](Self::allocate), probing the page in `hint` first and
    /// updating it on success.
    pub fn allocate_hinted(&self, bytes: usize, hint: &mut PageHint) -> Option<NonNull<u8>> {
        if self.geometry.level_for(bytes).is_none() {
            debug_assert!(false, "{bytes} bytes is not a slot size; snap it first");
            return None;
        }

        {
            let table = sync::read(&self.table);
            if let Some(ptr) = self.allocate_from(&table, bytes, hint) {
                return Some(ptr);
            }
        }

        let mut table = sync::write(&self.table);
        // Another writer may have added a page while we waited.
        if let Some(ptr) = self.allocate_from(&table, bytes, hint) {
            return Some(ptr);
        }
        let page = self.acquire_page()?;
        let page_ptr = page.as_ptr();
        table.trie.insert(page.base(), page_ptr);
        table.pages.push(page);
        // Safety: the page is owned by the table we hold.
        let page = unsafe { page_ptr.as_ref() };
        self.allocate_in(page, 0, bytes, hint)
    }

    fn allocate_from(&self, table: &PageTable, bytes: usize, hint: &mut PageHint) -> Option<NonNull<u8>> {
        let hinted = (hint.page != 0).then(|| table.trie.get(hint.page)).flatten();
        if let Some(page) = hinted {
            // Safety: pages in the trie are owned by the table.
            if let Some(ptr) = self.allocate_in(unsafe { page.as_ref() }, hint.block, bytes, hint) {
                return Some(ptr);
            }
        }
        table
            .pages
            .iter()
            .filter(|p| Some(p.as_ptr()) != hinted)
            .find_map(|p| self.allocate_in(p, 0, bytes, hint))
    }

    fn allocate_in(&self, page: &Page, block: usize, bytes: usize, hint: &mut PageHint) -> Option<NonNull<u8>> {
        let allocation = page.allocate(self.cache.vm(), block, bytes, &*self.tracker)?;
        if allocation.revived {
            // Saturating: the counter is approximate.
            let _ = self
                .unused_pages
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        self.tracker.allocate_user(bytes);
        *hint = PageHint {
            page: page.base(),
            block: allocation.block,
        };
        Some(allocation.ptr)
    }

    fn acquire_page(&self) -> Option<OwnedPage> {
        let free = match self.cache.grab_page() {
            Ok(page) => page,
            Err(e) => {
                log::warn!("allocator: page cache could not supply a page: {e}");
                return None;
            }
        };
        match free.assign(self.cache.vm(), self.geometry) {
            Ok(page) => {
                log::debug!("allocator: acquired page {:#x}", page.base());
                Some(page)
            }
            Err((free, e)) => {
                log::warn!(
                    "allocator: reserving {} bytes for a page failed: {e}",
                    self.geometry.span()
                );
                self.cache.release_page(free);
                None
            }
        }
    }

    #[inline]
    fn find_page(&self, table: &PageTable, ptr: NonNull<u8>, hint: Option<&PageHint>) -> Option<NonNull<Page>> {
        let addr = ptr.as_ptr() as usize;
        if let Some(page) = hint.filter(|h| h.page != 0).and_then(|h| table.trie.get(h.page)) {
            // Safety: pages in the trie are owned by the table.
            if unsafe { page.as_ref() }.contains(addr) {
                return Some(page);
            }
        }
        table.trie.get(addr)
    }

    /// Free a slot returned by this allocator.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator; it must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        unsafe { self.free_inner(ptr, None) }
    }

    /// [`free`](Self::free), resolving the page through `hint` when it
    /// matches.
    ///
    /// # Safety
    /// Same as [`free`](Self::free).
    pub unsafe fn free_hinted(&self, ptr: NonNull<u8>, hint: &PageHint) {
        // Safety: forwarded contract.
        unsafe { self.free_inner(ptr, Some(hint)) }
    }

    unsafe fn free_inner(&self, ptr: NonNull<u8>, hint: Option<&PageHint>) {
        let unused = {
            let table = sync::read(&self.table);
            let Some(page) = self.find_page(&table, ptr, hint) else {
                debug_assert!(false, "pointer {ptr:p} does not belong to this allocator");
                return;
            };
            // Safety: owned by the table we hold.
            let page = unsafe { page.as_ref() };
            let Some(released) = page.free(ptr) else {
                return;
            };
            self.tracker.deallocate_user(released.bytes);
            if !released.page_unused {
                return;
            }
            page.try_enqueue_gc(&self.gc_head);
            self.unused_pages.fetch_add(1, Ordering::AcqRel) + 1
        };
        if unused > RETAINED_UNUSED_PAGES {
            self.garbage_collect();
        }
    }

    /// Change the slot size of `ptr` in place. Returns `ptr` on success and
    /// `None` if the neighbouring slots needed to grow are in use; the
    /// allocation is unchanged then.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator. After shrinking,
    /// bytes past the new size must not be accessed.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, bytes: usize) -> Option<NonNull<u8>> {
        if self.geometry.level_for(bytes).is_none() {
            debug_assert!(false, "resize to {bytes} bytes: not a slot size of this allocator");
            return None;
        }
        let table = sync::read(&self.table);
        let Some(page) = self.find_page(&table, ptr, None) else {
            debug_assert!(false, "pointer {ptr:p} does not belong to this allocator");
            return None;
        };
        // Safety: owned by the table we hold.
        let old = unsafe { page.as_ref() }.resize(ptr, bytes)?;
        if bytes > old {
            self.tracker.allocate_user(bytes - old);
        } else {
            self.tracker.deallocate_user(old - bytes);
        }
        Some(ptr)
    }

    /// Slot size of the live allocation at `ptr`, or 0 if `ptr` is not one.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        let table = sync::read(&self.table);
        self.find_page(&table, ptr, None)
            // Safety: owned by the table we hold.
            .and_then(|page| unsafe { page.as_ref() }.allocation_size(ptr))
            .unwrap_or(0)
    }

    /// Collect unused pages if the writer lock is free; otherwise skip.
    pub fn garbage_collect(&self) {
        let Some(mut table) = sync::try_write(&self.table) else {
            return;
        };
        self.collect(&mut table, false);
    }

    /// Decommit trailing empty blocks of every page and return every empty
    /// page to the cache.
    pub fn force_garbage_collect(&self) {
        let mut table = sync::write(&self.table);
        self.collect(&mut table, true);
    }

    fn collect(&self, table: &mut PageTable, forced: bool) {
        let vm = self.cache.vm();
        let mut candidates = Vec::new();
        // Safety: writer lock held; every queued page is in `table`.
        unsafe { page::drain_gc_list(&self.gc_head, |p| candidates.push(p)) };
        if forced {
            table.retained = None;
            candidates = table.pages.iter().map(OwnedPage::as_ptr).collect();
        }

        let mut decommitted = 0;
        let mut releasable = Vec::new();
        for candidate in candidates {
            // Safety: owned by the table we hold exclusively.
            let page = unsafe { candidate.as_ref() };
            if forced {
                // Safety: writer lock held.
                decommitted += unsafe { page.garbage_collect(vm, &*self.tracker) };
            }
            if page.live_allocations() != 0 {
                continue;
            }
            if !forced {
                let keep = match table.retained {
                    Some(retained) if retained == candidate => true,
                    // Safety: the retained page is owned by the table.
                    Some(retained) if unsafe { retained.as_ref() }.live_allocations() == 0 => false,
                    _ => {
                        table.retained = Some(candidate);
                        true
                    }
                };
                if keep {
                    continue;
                }
                // Safety: writer lock held.
                decommitted += unsafe { page.garbage_collect(vm, &*self.tracker) };
            }
            if page.num_blocks() == 0 {
                releasable.push(candidate);
            }
        }

        let released = releasable.len();
        for candidate in releasable {
            if let Some(owned) = table.remove(candidate) {
                let base = owned.base();
                self.cache.release_page(owned.into_free(vm, &*self.tracker));
                log::debug!("allocator: returned page {base:#x} to the page cache");
            }
        }

        let unused = table.pages.iter().filter(|p| p.live_allocations() == 0).count();
        self.unused_pages.store(unused, Ordering::Release);
        if decommitted > 0 || released > 0 {
            log::debug!(
                "allocator: collected {decommitted} bytes, released {released} pages, {} pages remain",
                table.pages.len()
            );
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        self.for_each_page(|info| {
            stats.allocated += info.allocated_bytes;
            stats.committed += info.committed_bytes;
            stats.allocation_count += info.live_allocations;
        });
        stats.available = stats.committed.saturating_sub(stats.allocated);
        stats
    }

    /// Number of pages currently owned.
    pub fn page_count(&self) -> usize {
        sync::read(&self.table).pages.len()
    }

    /// Approximate number of owned pages with no live allocations.
    pub fn unused_pages(&self) -> usize {
        self.unused_pages.load(Ordering::Acquire)
    }

    pub fn for_each_page(&self, mut f: impl FnMut(&PageInfo)) {
        let table = sync::read(&self.table);
        for page in &table.pages {
            f(&page.info());
        }
    }

    pub fn for_each_block(&self, mut f: impl FnMut(&BlockInfo)) {
        let table = sync::read(&self.table);
        for page in &table.pages {
            page.for_each_block(&mut f);
        }
    }

    /// Check every owned page's bookkeeping. Blocks writers and other
    /// threads' frees while it runs.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self) -> Result<(), SanityError> {
        let table = sync::write(&self.table);
        for page in &table.pages {
            if let Err(e) = page.validate() {
                log::error!("allocator: sanity check failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<V: VmOps> Drop for Allocator<V> {
    fn drop(&mut self) {
        let mut table = sync::write(&self.table);
        // Safety: exclusive; every queued page is in `table`.
        unsafe { page::drain_gc_list(&self.gc_head, |_| {}) };
        table.retained = None;
        table.trie.clear();
        let vm = self.cache.vm();
        for page in table.pages.drain(..) {
            let live = page.live_allocations();
            if live > 0 {
                log::warn!("allocator dropped with {live} live allocations in page {:#x}", page.base());
            }
            self.cache.release_page(page.into_free(vm, &*self.tracker));
        }
    }
}
