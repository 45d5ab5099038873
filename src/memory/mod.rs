pub mod allocator;
pub(crate) mod bit_tree;
pub(crate) mod block;
pub(crate) mod loom_tests;
pub(crate) mod page;
pub mod page_cache;
pub(crate) mod page_pool;
pub(crate) mod page_trie;
pub mod stats;
pub mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
