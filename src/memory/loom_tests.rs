/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the block CAS loops, the pool free-list, page growth and the
/// allocator's reader/writer protocol under every thread interleaving loom
/// can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - One or two operations per thread.
///   - Pages and pools are created fresh inside every model iteration and go
///     through the heap-backed `PlatformVmOps` under cfg(loom).
///   - `GlobalPageCache` is NOT tested: its OnceLock static does not reset
///     between loom iterations. Everything it does is reachable through an
///     instance `PageCache`.
///   - Anything that touches a page (growth barrier spin, pool lists) uses
///     `preemption_bound(2)`.
#[cfg(loom)]
mod tests {
    use crate::memory::bit_tree::{EMPTY_MIPS, LEAF_LEVEL, first_bit};
    use crate::memory::block::{Block, Uncontended};
    use crate::sync::Arc;

    const LEAF: usize = 4096;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn fresh_block() -> Block {
        let b = Block::new();
        b.reset();
        b
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });
            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. Block CAS loops
    // =====================================================================

    #[test]
    fn loom_block_concurrent_claims_are_distinct() {
        loom::model(|| {
            let block = Arc::new(fresh_block());
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let block = block.clone();
                    loom::thread::spawn(move || {
                        let (bit, _) = block.try_claim(LEAF_LEVEL, &Uncontended).unwrap();
                        block.mark_size(bit);
                        bit
                    })
                })
                .collect();
            let bits: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_ne!(bits[0], bits[1]);
            let first = first_bit(LEAF_LEVEL);
            assert!(bits.contains(&first) && bits.contains(&(first + 1)));
            block.validate().unwrap();
        });
    }

    #[test]
    fn loom_block_sibling_frees_coalesce() {
        loom::model(|| {
            let block = Arc::new(fresh_block());
            let mut bits = Vec::new();
            for _ in 0..2 {
                let (bit, _) = block.try_claim(LEAF_LEVEL, &Uncontended).unwrap();
                block.mark_size(bit);
                bits.push(bit);
            }
            let handles: Vec<_> = bits
                .into_iter()
                .map(|bit| {
                    let block = block.clone();
                    loom::thread::spawn(move || {
                        assert!(block.clear_size(bit));
                        block.try_merge(bit, &Uncontended)
                    })
                })
                .collect();
            let transitions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            // Whichever free lands second sees its buddy and merges to the root.
            assert_eq!(block.mips(), EMPTY_MIPS);
            assert_eq!(transitions.iter().filter(|t| t.became_empty()).count(), 1);
        });
    }

    #[test]
    fn loom_block_claim_races_free() {
        loom::model(|| {
            let block = Arc::new(fresh_block());
            let (held, _) = block.try_claim(0, &Uncontended).unwrap();
            block.mark_size(held);

            let freer = {
                let block = block.clone();
                loom::thread::spawn(move || {
                    assert!(block.clear_size(held));
                    block.try_merge(held, &Uncontended);
                })
            };
            let claimer = {
                let block = block.clone();
                loom::thread::spawn(move || {
                    let claimed = block.try_claim(LEAF_LEVEL, &Uncontended);
                    if let Some((bit, _)) = claimed {
                        block.mark_size(bit);
                    }
                    claimed.map(|(bit, _)| bit)
                })
            };
            freer.join().unwrap();
            // Either the root was still held (no leaf) or leaf 0 was handed out.
            if let Some(bit) = claimer.join().unwrap() {
                assert_eq!(bit, first_bit(LEAF_LEVEL));
            }
            block.validate().unwrap();
        });
    }

    // =====================================================================
    // 3. PagePool free-list
    // =====================================================================

    #[test]
    fn loom_pool_grab_give_returns_every_slot() {
        use crate::memory::page_pool::PagePool;
        use crate::memory::vm::PlatformVmOps;

        bounded(2).check(|| {
            let vm = PlatformVmOps;
            let pool = PagePool::create(&vm, 64 * 1024).unwrap();
            let addr = pool.as_ptr() as usize;

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    loom::thread::spawn(move || {
                        // Safety: the pool outlives both threads.
                        let p = unsafe { &*(addr as *const PagePool) };
                        let page = p.grab().unwrap();
                        let raw = page.pool().as_ptr() as usize;
                        p.give(page);
                        raw
                    })
                })
                .collect();
            for h in handles {
                assert_eq!(h.join().unwrap(), addr);
            }
            // Safety: joined; nothing busy.
            let p = unsafe { pool.as_ref() };
            assert_eq!(p.num_busy(), 0);
            assert!(p.num_registered() <= 2);
            // Safety: as above.
            unsafe { PagePool::destroy(pool, &vm) };
        });
    }

    // =====================================================================
    // 4. Page growth barrier
    // =====================================================================

    #[test]
    fn loom_page_growth_commits_each_block_once() {
        use crate::memory::page::Geometry;
        use crate::memory::page_cache::PageCache;
        use crate::memory::stats::NullTracker;
        use crate::memory::vm::PlatformVmOps;

        bounded(2).check(|| {
            let cache = Arc::new(PageCache::new(PlatformVmOps));
            let geo = Geometry::new(LEAF, 2);
            let page = cache
                .grab_page()
                .unwrap()
                .assign(cache.vm(), geo)
                .map_err(|(_, e)| e)
                .unwrap();
            let addr = std::ptr::from_ref::<crate::memory::page::Page>(&page) as usize;

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let cache = cache.clone();
                    loom::thread::spawn(move || {
                        // Safety: the page outlives both threads.
                        let page = unsafe { &*(addr as *const crate::memory::page::Page) };
                        let a = page
                            .allocate(cache.vm(), 0, geo.block_size(), &NullTracker)
                            .unwrap();
                        a.ptr.as_ptr() as usize
                    })
                })
                .collect();
            let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_ne!(addrs[0], addrs[1]);
            assert_eq!(page.num_blocks(), 2);
            page.validate().unwrap();

            cache.release_page(page.into_free(cache.vm(), &NullTracker));
        });
    }

    // =====================================================================
    // 5. Allocator reader/writer protocol
    // =====================================================================

    #[test]
    fn loom_allocator_concurrent_first_allocation() {
        use crate::memory::allocator::{Allocator, AllocatorConfig};
        use crate::memory::page_cache::PageCache;
        use crate::memory::vm::PlatformVmOps;

        bounded(2).check(|| {
            let cache = Arc::new(PageCache::new(PlatformVmOps));
            let config = AllocatorConfig {
                leaf_size: LEAF,
                max_blocks: 1,
            };
            let alloc = Arc::new(Allocator::with_cache(cache.clone(), config).unwrap());

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let alloc = alloc.clone();
                    loom::thread::spawn(move || alloc.allocate(LEAF).unwrap().as_ptr() as usize)
                })
                .collect();
            let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_ne!(addrs[0], addrs[1]);
            // Both threads raced to the writer lock; only one page was added.
            assert_eq!(alloc.page_count(), 1);
            alloc.validate().unwrap();
        });
    }

    #[test]
    fn loom_allocator_free_races_allocate() {
        use crate::memory::allocator::{Allocator, AllocatorConfig};
        use crate::memory::page_cache::PageCache;
        use crate::memory::vm::PlatformVmOps;

        bounded(2).check(|| {
            let cache = Arc::new(PageCache::new(PlatformVmOps));
            let config = AllocatorConfig {
                leaf_size: LEAF,
                max_blocks: 1,
            };
            let alloc = Arc::new(Allocator::with_cache(cache.clone(), config).unwrap());
            let first = alloc.allocate(LEAF).unwrap().as_ptr() as usize;

            let freer = {
                let alloc = alloc.clone();
                loom::thread::spawn(move || {
                    let ptr = std::ptr::NonNull::new(first as *mut u8).unwrap();
                    // Safety: `first` is live and freed exactly once.
                    unsafe { alloc.free(ptr) };
                })
            };
            let allocator = {
                let alloc = alloc.clone();
                loom::thread::spawn(move || alloc.allocate(2 * LEAF).unwrap().as_ptr() as usize)
            };
            freer.join().unwrap();
            let second = allocator.join().unwrap();

            assert_eq!(alloc.allocation_size(std::ptr::NonNull::new(second as *mut u8).unwrap()), 2 * LEAF);
            assert_eq!(alloc.memory_stats().allocation_count, 1);
            alloc.validate().unwrap();
        });
    }
}
