//! # Page Cache
//!
//! A bounded set of page frames addressed by page number. Every cached page
//! is always reachable through the index; frames whose pin count has dropped
//! to zero are additionally kept on a *free list* in unpin order, which is
//! the pool eviction draws from.
//!
//! ## Frame State
//!
//! ```text
//! Frame
//! ├── page_no       1-indexed position in the database file
//! ├── pin_count     readers holding the page resident
//! ├── dirty         modified since the last journal flush
//! ├── in_journal    pre-image already recorded this transaction
//! ├── in_ckpt       pre-image already recorded this checkpoint
//! ├── last_used     LRU stamp, bumped on every access
//! ├── image         the 1024-byte on-disk image
//! └── extra         typed overlay state (see PageExtra)
//! ```
//!
//! ## Eviction
//!
//! Two interchangeable strategies:
//!
//! - **FirstNonDirty** walks the free list in unpin order and takes the
//!   first clean frame.
//! - **Lru** takes the clean unpinned frame with the oldest access stamp.
//!
//! Dirty frames are never evicted directly; the pager first syncs the
//! journal and flushes them, which makes them clean and eligible. Pinned
//! frames are never eligible.

use std::collections::HashMap;

use crate::config::{MIN_CACHE_SIZE, PAGE_SIZE};
use crate::storage::{PageImage, PageNumber};

/// Strategy used to pick a reclaimable frame when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// First clean frame in unpin order.
    #[default]
    FirstNonDirty,
    /// Clean unpinned frame with the least recent access.
    Lru,
}

pub(crate) struct Frame<E> {
    pub page_no: PageNumber,
    pub pin_count: u32,
    pub dirty: bool,
    pub in_journal: bool,
    pub in_ckpt: bool,
    pub last_used: u64,
    pub image: Box<PageImage>,
    pub extra: E,
}

impl<E: Default> Frame<E> {
    pub fn new(page_no: PageNumber, image: Box<PageImage>) -> Self {
        Self {
            page_no,
            pin_count: 0,
            dirty: false,
            in_journal: false,
            in_ckpt: false,
            last_used: 0,
            image,
            extra: E::default(),
        }
    }
}

pub(crate) struct PageCache<E> {
    frames: HashMap<PageNumber, Frame<E>>,
    /// Page numbers whose pin count is zero, oldest unpin first.
    free_order: Vec<PageNumber>,
    capacity: usize,
    policy: EvictionPolicy,
    tick: u64,
}

impl<E> PageCache<E> {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            frames: HashMap::new(),
            free_order: Vec::new(),
            capacity: capacity.max(MIN_CACHE_SIZE),
            policy,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity > MIN_CACHE_SIZE {
            self.capacity = capacity;
        }
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn get(&self, page_no: PageNumber) -> Option<&Frame<E>> {
        self.frames.get(&page_no)
    }

    pub fn get_mut(&mut self, page_no: PageNumber) -> Option<&mut Frame<E>> {
        self.frames.get_mut(&page_no)
    }

    pub fn insert(&mut self, frame: Frame<E>) {
        debug_assert!(!self.frames.contains_key(&frame.page_no));
        if frame.pin_count == 0 {
            self.free_order.push(frame.page_no);
        }
        self.frames.insert(frame.page_no, frame);
    }

    pub fn remove(&mut self, page_no: PageNumber) -> Option<Frame<E>> {
        self.free_order.retain(|&pn| pn != page_no);
        self.frames.remove(&page_no)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.free_order.clear();
    }

    /// Bumps the access stamp used by the LRU policy.
    pub fn touch(&mut self, page_no: PageNumber) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(frame) = self.frames.get_mut(&page_no) {
            frame.last_used = tick;
        }
    }

    /// Records that `page_no` dropped to pin count zero.
    pub fn note_unpinned(&mut self, page_no: PageNumber) {
        debug_assert!(!self.free_order.contains(&page_no));
        self.free_order.push(page_no);
    }

    /// Records that `page_no` was re-pinned and left the free pool.
    pub fn note_pinned(&mut self, page_no: PageNumber) {
        self.free_order.retain(|&pn| pn != page_no);
    }

    pub fn has_free_frames(&self) -> bool {
        !self.free_order.is_empty()
    }

    /// Unpinned frames in unpin order; the flush set for the pager.
    pub fn free_frames(&self) -> Vec<PageNumber> {
        self.free_order.clone()
    }

    /// All resident page numbers.
    pub fn pages(&self) -> Vec<PageNumber> {
        self.frames.keys().copied().collect()
    }

    /// Picks the frame to recycle under the configured policy, or `None`
    /// when every unpinned frame is dirty (or nothing is unpinned).
    pub fn pick_victim(&self) -> Option<PageNumber> {
        match self.policy {
            EvictionPolicy::FirstNonDirty => self
                .free_order
                .iter()
                .copied()
                .find(|pn| self.frames.get(pn).is_some_and(|f| !f.dirty)),
            EvictionPolicy::Lru => self
                .free_order
                .iter()
                .copied()
                .filter(|pn| self.frames.get(pn).is_some_and(|f| !f.dirty))
                .min_by_key(|pn| self.frames[pn].last_used),
        }
    }
}

/// Allocates a zeroed page image off the heap without a stack round-trip.
pub(crate) fn zeroed_image() -> Box<PageImage> {
    vec![0u8; PAGE_SIZE]
        .into_boxed_slice()
        .try_into()
        .unwrap_or_else(|_| Box::new([0u8; PAGE_SIZE]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(page_no: PageNumber, pinned: bool, dirty: bool) -> Frame<()> {
        let mut f = Frame::new(page_no, zeroed_image());
        f.pin_count = u32::from(pinned);
        f.dirty = dirty;
        f
    }

    fn cache_with(policy: EvictionPolicy, frames: Vec<Frame<()>>) -> PageCache<()> {
        let mut cache = PageCache::new(MIN_CACHE_SIZE, policy);
        for f in frames {
            cache.insert(f);
        }
        cache
    }

    #[test]
    fn capacity_is_clamped_to_minimum() {
        let cache: PageCache<()> = PageCache::new(2, EvictionPolicy::FirstNonDirty);
        assert_eq!(cache.capacity(), MIN_CACHE_SIZE);
    }

    #[test]
    fn first_non_dirty_follows_unpin_order() {
        let cache = cache_with(
            EvictionPolicy::FirstNonDirty,
            vec![frame(1, false, true), frame(2, false, false), frame(3, false, false)],
        );
        assert_eq!(cache.pick_victim(), Some(2));
    }

    #[test]
    fn pinned_frames_are_never_victims() {
        let cache = cache_with(
            EvictionPolicy::FirstNonDirty,
            vec![frame(1, true, false), frame(2, true, false)],
        );
        assert_eq!(cache.pick_victim(), None);
    }

    #[test]
    fn all_dirty_yields_no_victim() {
        let cache = cache_with(
            EvictionPolicy::FirstNonDirty,
            vec![frame(1, false, true), frame(2, false, true)],
        );
        assert_eq!(cache.pick_victim(), None);
    }

    #[test]
    fn lru_picks_oldest_access() {
        let mut cache = cache_with(
            EvictionPolicy::Lru,
            vec![frame(1, false, false), frame(2, false, false), frame(3, false, false)],
        );
        cache.touch(1);
        cache.touch(3);
        cache.touch(2);
        assert_eq!(cache.pick_victim(), Some(1));
        cache.touch(1);
        assert_eq!(cache.pick_victim(), Some(3));
    }

    #[test]
    fn repinned_frames_leave_the_free_pool() {
        let mut cache = cache_with(EvictionPolicy::FirstNonDirty, vec![frame(1, false, false)]);
        cache.note_pinned(1);
        assert_eq!(cache.pick_victim(), None);
        cache.note_unpinned(1);
        assert_eq!(cache.pick_victim(), Some(1));
    }

    #[test]
    fn remove_clears_free_order() {
        let mut cache = cache_with(EvictionPolicy::FirstNonDirty, vec![frame(4, false, false)]);
        assert!(cache.remove(4).is_some());
        assert!(!cache.has_free_frames());
        assert_eq!(cache.len(), 0);
    }
}
