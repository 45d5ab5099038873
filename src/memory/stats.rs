//! Memory accounting sink and diagnostic counters.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. user bytes may briefly exceed system bytes while a
//! block commit and its first allocation race). This is acceptable for
//! diagnostic display. Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Observational byte-accounting hooks.
///
/// *User* bytes are handed to callers by `allocate`/`resize` and returned by
/// `free`. *System* bytes are committed to or decommitted from the OS as
/// blocks grow and are garbage collected. Every method defaults to a no-op.
pub trait MemoryTracker: Send + Sync {
    fn allocate_user(&self, _bytes: usize) {}
    fn deallocate_user(&self, _bytes: usize) {}
    fn allocate_system(&self, _bytes: usize) {}
    fn deallocate_system(&self, _bytes: usize) {}
}

/// Tracker that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTracker;

impl MemoryTracker for NullTracker {}

/// Tracker backed by a user and a system [`Counter`] gauge.
#[derive(Default)]
pub struct CounterTracker {
    pub user: Counter,
    pub system: Counter,
}

impl CounterTracker {
    #[must_use]
    pub fn user_bytes(&self) -> usize {
        self.user.get()
    }

    #[must_use]
    pub fn system_bytes(&self) -> usize {
        self.system.get()
    }
}

impl MemoryTracker for CounterTracker {
    fn allocate_user(&self, bytes: usize) {
        self.user.add(bytes);
    }

    fn deallocate_user(&self, bytes: usize) {
        self.user.sub(bytes);
    }

    fn allocate_system(&self, bytes: usize) {
        self.system.add(bytes);
    }

    fn deallocate_system(&self, bytes: usize) {
        self.system.sub(bytes);
    }
}

// Lets a caller keep a handle on a tracker it gave away.
impl<T: MemoryTracker + ?Sized> MemoryTracker for std::sync::Arc<T> {
    fn allocate_user(&self, bytes: usize) {
        (**self).allocate_user(bytes);
    }

    fn deallocate_user(&self, bytes: usize) {
        (**self).deallocate_user(bytes);
    }

    fn allocate_system(&self, bytes: usize) {
        (**self).allocate_system(bytes);
    }

    fn deallocate_system(&self, bytes: usize) {
        (**self).deallocate_system(bytes);
    }
}
