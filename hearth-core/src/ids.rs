use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a stored item (image, audio file, character, map).
pub type ItemId = u64;

/// Process-wide source of [`ItemId`]s.
///
/// IDs are handed out in increasing order and never reused. Loaders call
/// [`IdAllocator::observe`] for every persisted ID so that freshly minted
/// IDs stay above anything already on disk.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next ID.
    pub fn next(&self) -> ItemId {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advance past `id` if it is ahead of the counter.
    pub fn observe(&self, id: ItemId) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }

    /// The most recently minted (or observed) ID.
    pub fn last(&self) -> ItemId {
        self.last.load(Ordering::SeqCst)
    }
}
