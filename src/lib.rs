#[cfg(not(target_pointer_width = "64"))]
compile_error!("mipalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// client-facing allocator
pub use memory::allocator::{
    Allocator, AllocatorConfig, BlockInfo, MemoryStats, PageHint, PageInfo,
};

// shared page recycling
pub use memory::page_cache::{PageCache, PageCacheConfig, PageCacheStats};
#[cfg(not(loom))]
pub use memory::page_cache::GlobalPageCache;

// diagnostics
pub use memory::page::SanityError;
pub use memory::stats::{CounterTracker, MemoryTracker, NullTracker};

// os capability set + errors
pub use memory::vm::{PlatformVmOps, VmError, VmOps};
