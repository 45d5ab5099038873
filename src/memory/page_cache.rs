//! Shared source of page slots for any number of allocators.
//!
//! The cache owns a singly linked list of [`PagePool`]s. Every list walk and
//! mutation happens under one spin lock, so a pool can be unlinked and
//! destroyed without readers holding stale pointers. The pool with the most
//! free slots is kept near the head; an empty pool is destroyed as soon as
//! its last page comes back unless it is the head, so one empty pool always
//! stays warm.

use super::page::FreePage;
use super::page_pool::PagePool;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::SpinLock;
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::ptr::NonNull;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageCacheConfig {
    /// Bytes reserved per pool (header plus page slots).
    pub pool_bytes: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            pool_bytes: 64 * 1024,
        }
    }
}

/// Point-in-time counters of a [`PageCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageCacheStats {
    /// Pools currently alive.
    pub pools: usize,
    /// Pools ever created by this cache.
    pub pools_created: usize,
    /// Page slots constructed across live pools.
    pub pages_registered: usize,
    /// Page slots currently lent out.
    pub pages_busy: usize,
    /// Page slots the live pools could hold.
    pub page_capacity: usize,
}

pub struct PageCache<V: VmOps = PlatformVmOps> {
    vm: V,
    config: PageCacheConfig,
    lock: SpinLock,
    head: AtomicPtr<PagePool>,
    pools: AtomicUsize,
    pools_created: AtomicUsize,
}

impl<V: VmOps> PageCache<V> {
    /// Cache with the default pool size.
    pub fn new(vm: V) -> Self {
        Self {
            vm,
            config: PageCacheConfig::default(),
            lock: SpinLock::new(),
            head: AtomicPtr::new(std::ptr::null_mut()),
            pools: AtomicUsize::new(0),
            pools_created: AtomicUsize::new(0),
        }
    }

    /// # Errors
    /// [`VmError::InvalidConfig`] if `config.pool_bytes` cannot hold one page
    /// slot.
    pub fn with_config(vm: V, config: PageCacheConfig) -> Result<Self, VmError> {
        if PagePool::capacity_for(config.pool_bytes) == 0 {
            return Err(VmError::InvalidConfig(format!(
                "pool_bytes {} is too small for a single page slot",
                config.pool_bytes
            )));
        }
        let mut cache = Self::new(vm);
        cache.config = config;
        Ok(cache)
    }

    #[inline]
    pub fn vm(&self) -> &V {
        &self.vm
    }

    #[inline]
    pub fn config(&self) -> &PageCacheConfig {
        &self.config
    }

    pub fn pages_per_pool(&self) -> usize {
        PagePool::capacity_for(self.config.pool_bytes)
    }

    /// Take a page slot, creating a pool when every pool is exhausted.
    pub(crate) fn grab_page(&self) -> Result<FreePage, VmError> {
        let _guard = self.lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        let mut prev: *mut PagePool = std::ptr::null_mut();
        let mut current = head;
        while let Some(pool) = NonNull::new(current) {
            // Safety: listed pools are live while the lock is held.
            let p = unsafe { pool.as_ref() };
            let next = p.next();
            if let Some(page) = p.grab() {
                if !prev.is_null() {
                    // Safety: `head` is listed (we passed it).
                    let head_available = unsafe { (*head).available() };
                    if p.available() > head_available {
                        // Safety: `prev` is listed.
                        unsafe { (*prev).set_next(next) };
                        p.set_next(head);
                        self.head.store(current, Ordering::Relaxed);
                    }
                }
                return Ok(page);
            }
            prev = current;
            current = next;
        }

        let pool = PagePool::create(&self.vm, self.config.pool_bytes)?;
        // Safety: freshly created.
        let p = unsafe { pool.as_ref() };
        p.set_next(head);
        self.head.store(pool.as_ptr(), Ordering::Relaxed);
        self.pools.fetch_add(1, Ordering::Relaxed);
        self.pools_created.fetch_add(1, Ordering::Relaxed);
        log::debug!("page cache: created pool {pool:p} with {} page slots", p.capacity());
        p.grab()
            .ok_or_else(|| VmError::InvalidConfig("new page pool has no slots".into()))
    }

    /// Return a slot to its pool.
    pub(crate) fn release_page(&self, page: FreePage) {
        let pool = page.pool();
        // Safety: a pool outlives the slots it lent out.
        if unsafe { pool.as_ref() }.give(page) {
            self.release_unused_pool(pool);
        }
    }

    /// Destroy `pool` if it is still listed, still unused and not the head.
    ///
    /// A racing thread may have destroyed `pool` already, so it is only
    /// compared by address until found on the list.
    fn release_unused_pool(&self, pool: NonNull<PagePool>) {
        let _guard = self.lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        if head == pool.as_ptr() {
            return;
        }
        let mut prev = head;
        while !prev.is_null() {
            // Safety: listed pools are live while the lock is held.
            let p = unsafe { &*prev };
            let next = p.next();
            if next == pool.as_ptr() {
                // Safety: found on the list, so live.
                let target = unsafe { pool.as_ref() };
                if target.num_busy() != 0 {
                    return;
                }
                p.set_next(target.next());
                self.pools.fetch_sub(1, Ordering::Relaxed);
                // Safety: unlinked under the lock with no busy slots.
                unsafe { PagePool::destroy(pool, &self.vm) };
                log::debug!("page cache: destroyed unused pool {pool:p}");
                return;
            }
            prev = next;
        }
    }

    /// Destroy every pool with no busy slots, the head included.
    pub fn trim(&self) {
        let _guard = self.lock.lock();
        let mut prev: *mut PagePool = std::ptr::null_mut();
        let mut current = self.head.load(Ordering::Relaxed);
        let mut destroyed = 0;
        while let Some(pool) = NonNull::new(current) {
            // Safety: listed pools are live while the lock is held.
            let p = unsafe { pool.as_ref() };
            let next = p.next();
            if p.num_busy() == 0 {
                match NonNull::new(prev) {
                    // Safety: `prev` is listed.
                    Some(prev) => unsafe { prev.as_ref() }.set_next(next),
                    None => self.head.store(next, Ordering::Relaxed),
                }
                // Safety: unlinked under the lock with no busy slots.
                unsafe { PagePool::destroy(pool, &self.vm) };
                destroyed += 1;
            } else {
                prev = current;
            }
            current = next;
        }
        self.pools.fetch_sub(destroyed, Ordering::Relaxed);
        if destroyed > 0 {
            log::debug!("page cache: trimmed {destroyed} unused pools");
        }
    }

    pub fn stats(&self) -> PageCacheStats {
        let _guard = self.lock.lock();
        let mut stats = PageCacheStats {
            pools_created: self.pools_created.load(Ordering::Relaxed),
            ..PageCacheStats::default()
        };
        let mut current = self.head.load(Ordering::Relaxed);
        while let Some(pool) = NonNull::new(current) {
            // Safety: listed pools are live while the lock is held.
            let p = unsafe { pool.as_ref() };
            stats.pools += 1;
            stats.pages_registered += p.num_registered();
            stats.pages_busy += p.num_busy();
            stats.page_capacity += p.capacity();
            current = p.next();
        }
        debug_assert_eq!(stats.pools, self.pools.load(Ordering::Relaxed));
        stats
    }
}

impl<V: VmOps> Drop for PageCache<V> {
    fn drop(&mut self) {
        let mut current = self.head.swap(std::ptr::null_mut(), Ordering::Relaxed);
        while let Some(pool) = NonNull::new(current) {
            // Safety: `&mut self`; every pool is still live.
            let p = unsafe { pool.as_ref() };
            current = p.next();
            if p.num_busy() != 0 {
                // Pages are still lent out; leaking the pool keeps them valid.
                debug_assert!(false, "page cache dropped with {} busy pages in {pool:p}", p.num_busy());
                log::error!("page cache dropped with {} busy pages; leaking pool {pool:p}", p.num_busy());
                continue;
            }
            // Safety: no busy slots and the list is gone.
            unsafe { PagePool::destroy(pool, &self.vm) };
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide cache
// ---------------------------------------------------------------------------

/// The platform page cache shared by every allocator built with
/// `Allocator::new`. Created on first use; never torn down.
#[cfg(not(loom))]
pub struct GlobalPageCache;

#[cfg(not(loom))]
impl GlobalPageCache {
    pub fn get() -> crate::sync::Arc<PageCache> {
        static CACHE: crate::sync::OnceLock<crate::sync::Arc<PageCache>> =
            crate::sync::OnceLock::new();
        CACHE
            .get_or_init(|| crate::sync::Arc::new(PageCache::new(PlatformVmOps)))
            .clone()
    }

    /// Destroy the global cache's unused pools.
    pub fn trim() {
        Self::get().trim();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::CountingVmOps;

    fn small_cache() -> PageCache<CountingVmOps> {
        // Room for only a couple of slots per pool so tests can cross pools.
        let slot = size_of::<crate::memory::page::Page>();
        PageCache::with_config(
            CountingVmOps::default(),
            PageCacheConfig {
                pool_bytes: 4096 + 2 * slot,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_tiny_pools() {
        assert!(matches!(
            PageCache::with_config(PlatformVmOps, PageCacheConfig { pool_bytes: 16 }),
            Err(VmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_first_grab_creates_one_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = PageCache::new(CountingVmOps::default());
        let a = cache.grab_page().unwrap();
        let b = cache.grab_page().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.pools, 1);
        assert_eq!(stats.pages_busy, 2);
        assert_eq!(CountingVmOps::count(&cache.vm().reserves), 1);
        cache.release_page(a);
        cache.release_page(b);
        // The head pool is retained even when empty.
        assert_eq!(cache.stats().pools, 1);
        assert_eq!(cache.stats().pages_busy, 0);
    }

    #[test]
    fn test_grows_new_pool_when_exhausted() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = small_cache();
        let per_pool = cache.pages_per_pool();
        assert!(per_pool >= 1);

        let pages: Vec<_> = (0..per_pool + 1).map(|_| cache.grab_page().unwrap()).collect();
        let stats = cache.stats();
        assert_eq!(stats.pools, 2);
        assert_eq!(stats.pools_created, 2);
        assert_eq!(stats.pages_busy, per_pool + 1);
        for page in pages {
            cache.release_page(page);
        }
        // The non-head pool goes away; the head stays.
        assert_eq!(cache.stats().pools, 1);
    }

    #[test]
    fn test_unused_non_head_pool_is_destroyed() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = small_cache();
        let per_pool = cache.pages_per_pool();

        // Fill pool A; pool B becomes the head.
        let first: Vec<_> = (0..per_pool).map(|_| cache.grab_page().unwrap()).collect();
        let extra = cache.grab_page().unwrap();
        assert_eq!(cache.stats().pools, 2);

        // Emptying A (not the head) destroys it.
        for page in first {
            cache.release_page(page);
        }
        assert_eq!(cache.stats().pools, 1);
        assert_eq!(CountingVmOps::count(&cache.vm().releases), 1);

        cache.release_page(extra);
        assert_eq!(cache.stats().pools, 1);
    }

    #[test]
    fn test_trim_destroys_head_too() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = PageCache::new(CountingVmOps::default());
        let page = cache.grab_page().unwrap();
        cache.release_page(page);
        assert_eq!(cache.stats().pools, 1);
        cache.trim();
        assert_eq!(cache.stats().pools, 0);
        assert_eq!(CountingVmOps::count(&cache.vm().reserved_bytes), 0);

        // Usable again afterwards.
        let page = cache.grab_page().unwrap();
        assert_eq!(cache.stats().pools_created, 2);
        cache.release_page(page);
    }

    #[test]
    fn test_trim_keeps_busy_pools() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = PageCache::new(CountingVmOps::default());
        let page = cache.grab_page().unwrap();
        cache.trim();
        assert_eq!(cache.stats().pools, 1);
        cache.release_page(page);
    }

    #[test]
    fn test_concurrent_grab_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let cache = small_cache();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let a = cache.grab_page().unwrap();
                        let b = cache.grab_page().unwrap();
                        cache.release_page(a);
                        cache.release_page(b);
                    }
                });
            }
        });
        let stats = cache.stats();
        assert_eq!(stats.pages_busy, 0);
        assert!(stats.pools >= 1);
    }

    #[test]
    fn test_global_cache_is_shared() {
        let a = GlobalPageCache::get();
        let b = GlobalPageCache::get();
        assert!(crate::sync::Arc::ptr_eq(&a, &b));
    }
}
