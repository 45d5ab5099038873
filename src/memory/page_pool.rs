//! Fixed-capacity arena of page slots backed by one VM reservation.
//!
//! Layout: a [`PagePool`] header at the start of the reservation, followed by
//! `capacity` [`Page`] slots. Slots are constructed lazily on first grab
//! (`num_registered` only grows) and then recycled through a tagged
//! lock-free free-list. The pool never hands out a slot it has not
//! constructed, and never frees a slot individually: the whole reservation
//! is released by [`PagePool::destroy`].

use super::page::{FreePage, Page, PageState};
use super::vm::{VmError, VmOps};
use crate::sync::Backoff;
use crate::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::ptr::NonNull;

const POOL_CANARY: u64 = 0x6D69_7070_6F6F_6C21;

/// Low half of the free-list head: slot index + 1 (0 = empty).
const INDEX_MASK: u64 = 0xFFFF_FFFF;

#[inline]
fn pack(tag: u64, next: u32) -> u64 {
    (tag << 32) | u64::from(next)
}

#[repr(C)]
pub(crate) struct PagePool {
    canary: u64,
    /// `(tag << 32) | (index + 1)`. The tag changes on every update so a
    /// stale head cannot be swapped back in (ABA).
    free_head: AtomicU64,
    num_busy: AtomicUsize,
    num_registered: AtomicUsize,
    capacity: usize,
    bytes: usize,
    /// Cache list link. Only touched under the cache lock.
    next: AtomicPtr<PagePool>,
}

impl PagePool {
    #[inline]
    fn slots_offset() -> usize {
        size_of::<PagePool>().next_multiple_of(align_of::<Page>())
    }

    /// Page slots that fit in a pool of `bytes`.
    pub fn capacity_for(bytes: usize) -> usize {
        let slots = bytes.saturating_sub(Self::slots_offset()) / size_of::<Page>();
        slots.min(INDEX_MASK as usize - 1)
    }

    /// Reserve and commit `bytes`, then write the pool header.
    ///
    /// # Errors
    /// Fails if `bytes` cannot hold a single slot or the VM refuses.
    pub fn create<V: VmOps + ?Sized>(vm: &V, bytes: usize) -> Result<NonNull<PagePool>, VmError> {
        let capacity = Self::capacity_for(bytes);
        if capacity == 0 {
            return Err(VmError::InvalidConfig(format!(
                "a page pool of {bytes} bytes cannot hold a {} byte page slot",
                size_of::<Page>()
            )));
        }
        let bytes = bytes.next_multiple_of(vm.page_size());
        // Safety: `bytes` is non-zero.
        let base = unsafe { vm.reserve(bytes)? };
        // Safety: the whole range was just reserved.
        if let Err(e) = unsafe { vm.commit(base, bytes) } {
            // Safety: exact range from `reserve`.
            if let Err(release) = unsafe { vm.release(base, bytes) } {
                log::error!("page pool: releasing failed reservation: {release}");
            }
            return Err(e);
        }

        let header = base.cast::<PagePool>();
        // Safety: committed, page aligned, large enough for the header.
        unsafe {
            header.as_ptr().write(PagePool {
                canary: POOL_CANARY,
                free_head: AtomicU64::new(0),
                num_busy: AtomicUsize::new(0),
                num_registered: AtomicUsize::new(0),
                capacity,
                bytes,
                next: AtomicPtr::new(std::ptr::null_mut()),
            });
        }
        Ok(header)
    }

    /// Drop every constructed slot and release the reservation.
    ///
    /// # Safety
    /// `pool` must come from [`create`](Self::create) with the same `vm`, no
    /// slot may be in use, and the pool must not be referenced afterwards.
    pub unsafe fn destroy<V: VmOps + ?Sized>(pool: NonNull<PagePool>, vm: &V) {
        // Safety: caller guarantees the header is live.
        let this = unsafe { pool.as_ref() };
        this.check_canary();
        debug_assert_eq!(this.num_busy(), 0, "destroying page pool {pool:p} with busy pages");
        let bytes = this.bytes;
        for index in 0..this.num_registered() {
            // Safety: registered slots are initialized and unused.
            unsafe { this.slot(index).as_ptr().drop_in_place() };
        }
        // Safety: header is initialized; nothing refers to it any more.
        unsafe { pool.as_ptr().drop_in_place() };
        // Safety: exact range from `create`.
        if let Err(e) = unsafe { vm.release(pool.cast(), bytes) } {
            log::error!("page pool {pool:p}: releasing {bytes} bytes failed: {e}");
        }
    }

    #[inline]
    pub fn check_canary(&self) {
        debug_assert_eq!(
            self.canary, POOL_CANARY,
            "page pool header at {:p} is corrupted",
            std::ptr::from_ref(self)
        );
    }

    #[inline]
    fn slot(&self, index: usize) -> NonNull<Page> {
        debug_assert!(index < self.capacity);
        let addr = std::ptr::from_ref(self) as usize + Self::slots_offset() + index * size_of::<Page>();
        // Safety: inside the committed reservation, hence non-null.
        unsafe { NonNull::new_unchecked(addr as *mut Page) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn num_busy(&self) -> usize {
        self.num_busy.load(Ordering::Acquire)
    }

    #[inline]
    pub fn num_registered(&self) -> usize {
        self.num_registered.load(Ordering::Acquire)
    }

    /// Slots that a grab could still return.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.num_busy().min(self.capacity)
    }

    #[inline]
    pub fn next(&self) -> *mut PagePool {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_next(&self, next: *mut PagePool) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// Take a free slot: recycled first, otherwise a never-used one.
    pub fn grab(&self) -> Option<FreePage> {
        self.check_canary();
        let page = match self.pop_free() {
            Some(page) => page,
            None => self.register()?,
        };
        self.num_busy.fetch_add(1, Ordering::AcqRel);
        // Safety: the slot is initialized, `Free`, and now exclusively ours.
        Some(unsafe { FreePage::from_raw(page) })
    }

    /// Return a slot. Returns true if the pool has no busy slots left.
    pub fn give(&self, page: FreePage) -> bool {
        self.check_canary();
        let page = page.into_raw();
        // Safety: the slot belongs to this pool and is initialized.
        let p = unsafe { page.as_ref() };
        debug_assert_eq!(p.pool().as_ptr().cast_const(), std::ptr::from_ref(self));
        debug_assert_eq!(p.state(), PageState::Free);
        self.push_free(p);
        self.num_busy.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn register(&self) -> Option<NonNull<Page>> {
        let index = self
            .num_registered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;
        let slot = self.slot(index);
        // Safety: the slot is committed and this index was claimed exactly once.
        unsafe {
            slot.as_ptr()
                .write(Page::vacant(NonNull::from(self), index as u32));
        }
        Some(slot)
    }

    fn pop_free(&self) -> Option<NonNull<Page>> {
        let mut backoff = Backoff::new();
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let top = (head & INDEX_MASK) as usize;
            if top == 0 {
                return None;
            }
            let slot = self.slot(top - 1);
            // Safety: only registered slots are ever pushed. The read may be
            // stale; the tagged exchange below rejects it then.
            let next = unsafe { slot.as_ref() }.pool_next();
            let new = pack((head >> 32).wrapping_add(1), next);
            match self
                .free_head
                .compare_exchange_weak(head, new, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(slot),
                Err(actual) => {
                    head = actual;
                    backoff.snooze();
                }
            }
        }
    }

    fn push_free(&self, page: &Page) {
        let mut backoff = Backoff::new();
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            page.set_pool_next((head & INDEX_MASK) as u32);
            let new = pack((head >> 32).wrapping_add(1), page.index() + 1);
            match self
                .free_head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    backoff.snooze();
                }
            }
        }
    }
}
