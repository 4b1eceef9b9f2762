//! Pool of reusable compute scratch textures.
//!
//! Available textures are kept sorted ascending by (width, height) so
//! assignment can take the smallest sufficient one. The pool owns every
//! scratch it has created; a scratch is either in the available list or
//! checked out to exactly one tile, never both. Total descriptor slots
//! (one per mip view, summed over live textures) are capped; allocating
//! past the cap first evicts the smallest available textures.

use crate::runtime::{ScratchExtent, ScratchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchKey(u32);

#[derive(Debug)]
struct PoolEntry<T> {
    scratch: T,
    debug_used: bool,
}

#[derive(Debug)]
pub struct ScratchPool<T> {
    entries: Vec<Option<PoolEntry<T>>>,
    free_entry_ids: Vec<u32>,
    // Sorted ascending by (width, height).
    available: Vec<ScratchKey>,
    descriptor_slots_used: u32,
    descriptor_slot_budget: u32,
}

impl<T: ScratchExtent> ScratchPool<T> {
    pub fn new(descriptor_slot_budget: u32) -> Self {
        Self {
            entries: Vec::new(),
            free_entry_ids: Vec::new(),
            available: Vec::new(),
            descriptor_slots_used: 0,
            descriptor_slot_budget,
        }
    }

    pub fn get(&self, key: ScratchKey) -> &T {
        &self.entry(key).scratch
    }

    /// Register a freshly created scratch as checked out to its requester.
    pub fn insert_checked_out(&mut self, scratch: T) -> ScratchKey {
        let cost = scratch.descriptor_slot_cost();
        self.descriptor_slots_used = self
            .descriptor_slots_used
            .checked_add(cost)
            .expect("descriptor slot accounting overflow");
        let entry = PoolEntry {
            scratch,
            debug_used: true,
        };
        let key = match self.free_entry_ids.pop() {
            Some(id) => {
                let slot = self
                    .entries
                    .get_mut(id as usize)
                    .expect("free entry id out of bounds");
                assert!(slot.is_none(), "free entry id points at a live scratch");
                *slot = Some(entry);
                ScratchKey(id)
            }
            None => {
                let id: u32 = self
                    .entries
                    .len()
                    .try_into()
                    .expect("scratch pool entry id overflow");
                self.entries.push(Some(entry));
                ScratchKey(id)
            }
        };
        key
    }

    /// Smallest available scratch satisfying `request`, if any. Linear
    /// lower-bound scan over the sorted available list.
    pub fn find_available(&self, request: ScratchRequest) -> Option<ScratchKey> {
        self.available
            .iter()
            .copied()
            .find(|key| self.entry(*key).scratch.satisfies(request))
    }

    pub fn check_out(&mut self, key: ScratchKey) {
        let position = self
            .available
            .iter()
            .position(|candidate| *candidate == key)
            .expect("checked out scratch must be in the available list");
        self.available.remove(position);
        let entry = self.entry_mut(key);
        assert!(!entry.debug_used, "scratch checked out twice");
        entry.debug_used = true;
    }

    pub fn release(&mut self, key: ScratchKey) {
        let size = {
            let entry = self.entry_mut(key);
            assert!(entry.debug_used, "released scratch was not checked out");
            entry.debug_used = false;
            (entry.scratch.width(), entry.scratch.height())
        };
        let position = self
            .available
            .partition_point(|candidate| self.size_of(*candidate) <= size);
        self.available.insert(position, key);
    }

    /// True when a new scratch costing `cost` descriptor slots would fit.
    pub fn fits(&self, cost: u32) -> bool {
        self.descriptor_slots_used.saturating_add(cost) <= self.descriptor_slot_budget
    }

    /// Evict smallest available textures until `cost` fits or the
    /// available list is empty. Returns whether it fits afterwards.
    pub fn make_room(&mut self, cost: u32) -> bool {
        while !self.fits(cost) {
            if !self.evict_smallest_available() {
                break;
            }
        }
        self.fits(cost)
    }

    fn evict_smallest_available(&mut self) -> bool {
        if self.available.is_empty() {
            return false;
        }
        let key = self.available.remove(0);
        let entry = self
            .entries
            .get_mut(key.0 as usize)
            .expect("available scratch key out of bounds")
            .take()
            .expect("available scratch entry missing");
        assert!(!entry.debug_used, "evicted scratch was checked out");
        self.descriptor_slots_used -= entry.scratch.descriptor_slot_cost();
        self.free_entry_ids.push(key.0);
        true
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.live_count() - self.available_count()
    }

    pub fn descriptor_slots_used(&self) -> u32 {
        self.descriptor_slots_used
    }

    pub fn descriptor_slot_budget(&self) -> u32 {
        self.descriptor_slot_budget
    }

    fn size_of(&self, key: ScratchKey) -> (u32, u32) {
        let scratch = &self.entry(key).scratch;
        (scratch.width(), scratch.height())
    }

    fn entry(&self, key: ScratchKey) -> &PoolEntry<T> {
        self.entries
            .get(key.0 as usize)
            .and_then(|slot| slot.as_ref())
            .expect("scratch key points at a destroyed entry")
    }

    fn entry_mut(&mut self, key: ScratchKey) -> &mut PoolEntry<T> {
        self.entries
            .get_mut(key.0 as usize)
            .and_then(|slot| slot.as_mut())
            .expect("scratch key points at a destroyed entry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DummyScratch {
        width: u32,
        height: u32,
        mip_level_count: u32,
    }

    impl DummyScratch {
        fn for_request(request: ScratchRequest) -> Self {
            Self {
                width: request.width,
                height: request.height,
                mip_level_count: request.mip_level_count,
            }
        }
    }

    impl ScratchExtent for DummyScratch {
        fn width(&self) -> u32 {
            self.width
        }
        fn height(&self) -> u32 {
            self.height
        }
        fn mip_level_count(&self) -> u32 {
            self.mip_level_count
        }
    }

    fn pool_with_available(sizes: &[(u32, u32)]) -> (ScratchPool<DummyScratch>, Vec<ScratchKey>) {
        let mut pool = ScratchPool::new(128);
        let mut keys = Vec::new();
        for (width, height) in sizes {
            let request = ScratchRequest::for_tile_texels(*width, *height);
            let key = pool.insert_checked_out(DummyScratch::for_request(request));
            pool.release(key);
            keys.push(key);
        }
        (pool, keys)
    }

    #[test]
    fn best_fit_takes_smallest_sufficient_texture() {
        let (pool, keys) = pool_with_available(&[(16, 16), (64, 64), (256, 256)]);
        let found = pool.find_available(ScratchRequest::for_tile_texels(40, 40));
        assert_eq!(found, Some(keys[1]));
    }

    #[test]
    fn best_fit_skips_too_small_textures() {
        let (pool, keys) = pool_with_available(&[(16, 16), (32, 32)]);
        assert_eq!(
            pool.find_available(ScratchRequest::for_tile_texels(20, 20)),
            Some(keys[1])
        );
        assert_eq!(pool.find_available(ScratchRequest::for_tile_texels(64, 64)), None);
    }

    #[test]
    fn release_keeps_available_list_sorted() {
        let (mut pool, keys) = pool_with_available(&[(64, 64), (16, 16), (256, 256)]);
        // Check out and release the middle one; order must be restored.
        pool.check_out(keys[0]);
        pool.release(keys[0]);
        let found = pool.find_available(ScratchRequest::for_tile_texels(10, 10));
        assert_eq!(found, Some(keys[1]));
    }

    #[test]
    fn make_room_evicts_smallest_first() {
        let mut pool = ScratchPool::new(16);
        let mut keys = Vec::new();
        for size in [4u32, 16, 64] {
            let request = ScratchRequest::for_tile_texels(size, size);
            let key = pool.insert_checked_out(DummyScratch::for_request(request));
            pool.release(key);
            keys.push(key);
        }
        // 3 + 5 + 7 = 15 slots used; a 7-slot request needs room.
        assert!(!pool.fits(7));
        assert!(pool.make_room(7));
        // The 4x4 (3 slots) and 16x16 (5 slots) were evicted, smallest first.
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.find_available(ScratchRequest::for_tile_texels(64, 64)), Some(keys[2]));
    }

    #[test]
    fn make_room_fails_when_checked_out_textures_hold_the_budget() {
        let mut pool = ScratchPool::new(8);
        let request = ScratchRequest::for_tile_texels(64, 64);
        let _key = pool.insert_checked_out(DummyScratch::for_request(request));
        assert!(!pool.make_room(7));
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn conservation_holds_across_checkout_and_release() {
        let (mut pool, keys) = pool_with_available(&[(16, 16), (64, 64)]);
        assert_eq!(pool.live_count(), pool.available_count() + pool.checked_out_count());
        pool.check_out(keys[0]);
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.checked_out_count(), 1);
        pool.release(keys[0]);
        assert_eq!(pool.checked_out_count(), 0);
    }

    #[test]
    #[should_panic(expected = "scratch checked out twice")]
    fn double_checkout_panics() {
        let (mut pool, keys) = pool_with_available(&[(16, 16)]);
        pool.check_out(keys[0]);
        // Force the key back into the available list to hit the guard.
        pool.available.push(keys[0]);
        pool.check_out(keys[0]);
    }

    #[test]
    fn entry_ids_are_reused_after_eviction() {
        let mut pool = ScratchPool::new(64);
        let request = ScratchRequest::for_tile_texels(16, 16);
        let first = pool.insert_checked_out(DummyScratch::for_request(request));
        pool.release(first);
        assert!(pool.make_room(64));
        assert_eq!(pool.live_count(), 0);
        let second = pool.insert_checked_out(DummyScratch::for_request(request));
        assert_eq!(first, second);
    }
}
