use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InvalidConfig(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InvalidConfig(msg) => write!(f, "invalid allocator configuration: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InvalidConfig(_) => None,
        }
    }
}

/// Virtual memory capability set consumed by the page cache and its pages.
///
/// One instance is owned by each [`PageCache`](super::page_cache::PageCache);
/// every page lent out by that cache reserves, commits and releases through it.
pub trait VmOps: Send + Sync {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// `size` must be non-zero.
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    ///
    /// # Safety
    /// `ptr..ptr+size` must lie inside a live reservation and `ptr` must be
    /// page aligned.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    ///
    /// # Safety
    /// Same range requirements as [`commit`](Self::commit). Nothing may access
    /// the range until it is committed again.
    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr`/`size` must be exactly a range returned by [`reserve`](Self::reserve).
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (commit granularity).
    fn page_size(&self) -> usize;
}

/// The process's real virtual memory (mmap / mprotect / madvise on unix).
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // Blocks are committed right before the first allocation lands
                // in them, so ask for immediate physical backing.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
            };

            Ok(())
        }

        unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation, then PROT_NONE removes
            // access so a use-after-decommit faults instead of reading stale data.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls and under Miri we want
// the pointer provenance of a plain allocation.  Every "reservation" is a
// zeroed heap allocation; commit / decommit are no-ops and release frees the
// heap block.  Non-unix targets use the same backing.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
const HEAP_VM_ALIGN: usize = 4096;

#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, HEAP_VM_ALIGN)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, HEAP_VM_ALIGN)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        HEAP_VM_ALIGN
    }
}

/// Forwarding `VmOps` that counts every call.  Used by tests as the
/// reservation-count probe.
#[cfg(test)]
pub(crate) struct CountingVmOps {
    inner: PlatformVmOps,
    pub reserves: crate::sync::atomic::AtomicUsize,
    pub releases: crate::sync::atomic::AtomicUsize,
    pub commits: crate::sync::atomic::AtomicUsize,
    pub decommits: crate::sync::atomic::AtomicUsize,
    /// Bytes currently reserved through this instance.
    pub reserved_bytes: crate::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Default for CountingVmOps {
    fn default() -> Self {
        use crate::sync::atomic::AtomicUsize;
        Self {
            inner: PlatformVmOps,
            reserves: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            decommits: AtomicUsize::new(0),
            reserved_bytes: AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl CountingVmOps {
    pub(crate) fn count(counter: &crate::sync::atomic::AtomicUsize) -> usize {
        counter.load(crate::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl VmOps for CountingVmOps {
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        use crate::sync::atomic::Ordering;
        // Safety: forwarded contract.
        let ptr = unsafe { self.inner.reserve(size)? };
        self.reserves.fetch_add(1, Ordering::SeqCst);
        self.reserved_bytes.fetch_add(size, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        self.commits.fetch_add(1, crate::sync::atomic::Ordering::SeqCst);
        // Safety: forwarded contract.
        unsafe { self.inner.commit(ptr, size) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        self.decommits.fetch_add(1, crate::sync::atomic::Ordering::SeqCst);
        // Safety: forwarded contract.
        unsafe { self.inner.decommit(ptr, size) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        use crate::sync::atomic::Ordering;
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.reserved_bytes.fetch_sub(size, Ordering::SeqCst);
        // Safety: forwarded contract.
        unsafe { self.inner.release(ptr, size) }
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_empty_reservation_is_rejected() {
        // Safety: nothing is mapped on failure.
        assert!(unsafe { PlatformVmOps.reserve(0) }.is_err());
    }

    #[test]
    fn test_os_page_size_divides_block_granules() {
        let size = PlatformVmOps.page_size();
        assert!(size.is_power_of_two(), "page size {size}");
        assert_eq!((64 * 1024 * 32) % size, 0);
    }

    #[test]
    fn test_blocks_commit_and_decommit_inside_one_reservation() {
        // A page window: blocks committed front to back, the trailing ones
        // decommitted together, then one committed again.
        let vm = PlatformVmOps;
        let block = vm.page_size() * 2;
        let blocks = 4;
        // Safety: every range stays inside the reservation.
        unsafe {
            let base = vm.reserve(block * blocks).unwrap();
            for i in 0..blocks {
                let start = NonNull::new(base.as_ptr().add(i * block)).unwrap();
                vm.commit(start, block).unwrap();
                start.as_ptr().write(i as u8);
                start.as_ptr().add(block - 1).write(0xA0 | i as u8);
            }
            for i in 0..blocks {
                assert_eq!(*base.as_ptr().add(i * block), i as u8);
                assert_eq!(*base.as_ptr().add((i + 1) * block - 1), 0xA0 | i as u8);
            }

            let tail = NonNull::new(base.as_ptr().add(block)).unwrap();
            vm.decommit(tail, block * (blocks - 1)).unwrap();
            assert_eq!(*base.as_ptr(), 0, "leading block stays committed");

            vm.commit(tail, block).unwrap();
            tail.as_ptr().write(0x5A);
            assert_eq!(*tail.as_ptr(), 0x5A);

            vm.release(base, block * blocks).unwrap();
        }
    }

    #[test]
    fn test_overreserved_window_contains_aligned_span() {
        // Pages reserve `span + align - page_size` and round the base up.
        let vm = PlatformVmOps;
        let page = vm.page_size();
        let span = page * 8;
        let align = span;
        let len = span + align - page;
        // Safety: only the reservation is touched.
        unsafe {
            let raw = vm.reserve(len).unwrap();
            let addr = raw.as_ptr() as usize;
            let aligned = addr.next_multiple_of(align);
            assert!(aligned + span <= addr + len);

            let start = NonNull::new(aligned as *mut u8).unwrap();
            vm.commit(start, span).unwrap();
            start.as_ptr().add(span - 1).write(7);
            vm.release(raw, len).unwrap();
        }
    }

    #[test]
    fn test_counting_vm_tracks_calls() {
        let vm = CountingVmOps::default();
        let size = vm.page_size() * 2;
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(size).unwrap();
            vm.commit(ptr, size).unwrap();
            vm.decommit(ptr, size).unwrap();
            assert_eq!(CountingVmOps::count(&vm.reserved_bytes), size);
            vm.release(ptr, size).unwrap();
        }
        assert_eq!(CountingVmOps::count(&vm.reserves), 1);
        assert_eq!(CountingVmOps::count(&vm.commits), 1);
        assert_eq!(CountingVmOps::count(&vm.decommits), 1);
        assert_eq!(CountingVmOps::count(&vm.releases), 1);
        assert_eq!(CountingVmOps::count(&vm.reserved_bytes), 0);
    }
}
