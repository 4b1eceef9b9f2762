//! Streaming tile cache for heightfield metadata.
//!
//! Supplies per-tile (min, max) elevation ranges to a terrain renderer on
//! demand. The expensive part, a GPU mip-chain reduction over the tile's
//! source texel region, runs asynchronously: `acquire` never blocks and
//! `update` advances the pipeline one non-blocking tick per frame
//! (eviction sweep, then request scheduling, then completion reaping).
//! Completion is detected by polling, never by waiting, so GPU pressure
//! shows up as tiles staying requested or pending longer, not as stalls.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bitvec::prelude::{BitVec, Lsb0};
use height_protocol::{HeightRange, NormalizedRegion, SourceExtent};
use static_assertions::const_assert;

pub use runtime::{
    ReduceReadbackError, ReduceRuntime, ReduceSubmitError, ScratchCreateError, ScratchExtent,
    ScratchRequest, SlotStatus,
};
pub use scratch::{ScratchKey, ScratchPool};
pub use tile_id::TileId;

const IDLE_TIMEOUT_MILLIS: u64 = 10_000;
const EXPIRE_TIMEOUT_MILLIS: u64 = 30_000;
const_assert!(IDLE_TIMEOUT_MILLIS < EXPIRE_TIMEOUT_MILLIS);

/// Active tiles unused for longer than this are demoted to the idle
/// registry on the next tick.
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(IDLE_TIMEOUT_MILLIS);

/// Idle tiles unused for longer than this are deleted.
pub const EXPIRE_TIMEOUT: Duration = Duration::from_millis(EXPIRE_TIMEOUT_MILLIS);

/// Hard cap on descriptor slots consumed by the scratch texture pool,
/// one slot per pooled mip-level view.
pub const DESCRIPTOR_SLOT_BUDGET: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub idle_timeout: Duration,
    pub expire_timeout: Duration,
    pub descriptor_slot_budget: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            expire_timeout: EXPIRE_TIMEOUT,
            descriptor_slot_budget: DESCRIPTOR_SLOT_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Empty,
    Requested,
    Pending,
    Available,
}

/// Non-owning handle to a cached tile. Stays copyable and cheap; resolving
/// it after the underlying tile was deleted yields `None` for every
/// accessor (the creation serial no longer matches).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRef {
    id: TileId,
    serial: u64,
}

impl TileRef {
    pub fn id(self) -> TileId {
        self.id
    }
}

#[derive(Debug)]
struct TileData {
    region: NormalizedRegion,
    serial: u64,
    state: TileState,
    height_range: Option<HeightRange>,
    texture_slot: Option<u32>,
    reference_count: u32,
    idle: bool,
    deleted: bool,
    queued: bool,
    time_last_used: Instant,
    time_requested: Option<Instant>,
    time_processed: Option<Instant>,
}

/// Per-logical-texture-slot record. Holds the scratch texture checked out
/// for an in-flight (or retrying) reduction; slot indices and scratch
/// textures are pooled independently.
#[derive(Debug, Default)]
struct TextureSlot {
    scratch: Option<ScratchKey>,
}

#[derive(Debug, Clone, Copy)]
struct PendingReduce {
    id: TileId,
    readback: u32,
}

/// Point-in-time observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounters {
    pub active_tiles: usize,
    pub idle_tiles: usize,
    pub queued_requests: usize,
    pub pending_reductions: usize,
    pub scratch_live: usize,
    pub scratch_available: usize,
    pub scratch_checked_out: usize,
    pub descriptor_slots_used: u32,
    pub readback_slots_total: usize,
    pub readback_slots_free: usize,
    pub submissions: u64,
    pub completions: u64,
    pub retried_submissions: u64,
    pub failed_scratch_allocations: u64,
}

pub struct HeightTileCache<R: ReduceRuntime> {
    runtime: R,
    extent: SourceExtent,
    config: CacheConfig,
    active: HashMap<TileId, TileData>,
    idle: HashMap<TileId, TileData>,
    texture_slots: Vec<TextureSlot>,
    free_texture_slots: Vec<u32>,
    slot_occupancy: BitVec<usize, Lsb0>,
    scratch_pool: ScratchPool<R::Scratch>,
    readback_slots: Vec<R::Slot>,
    free_readback_slots: Vec<u32>,
    request_queue: Vec<TileId>,
    pending: Vec<PendingReduce>,
    next_serial: u64,
    submissions: u64,
    completions: u64,
    retried_submissions: u64,
    failed_scratch_allocations: u64,
}

impl<R: ReduceRuntime> HeightTileCache<R> {
    pub fn new(runtime: R, extent: SourceExtent) -> Self {
        Self::with_config(runtime, extent, CacheConfig::default())
    }

    pub fn with_config(runtime: R, extent: SourceExtent, config: CacheConfig) -> Self {
        let descriptor_slot_budget = config.descriptor_slot_budget;
        Self {
            runtime,
            extent,
            config,
            active: HashMap::new(),
            idle: HashMap::new(),
            texture_slots: Vec::new(),
            free_texture_slots: Vec::new(),
            slot_occupancy: BitVec::new(),
            scratch_pool: ScratchPool::new(descriptor_slot_budget),
            readback_slots: Vec::new(),
            free_readback_slots: Vec::new(),
            request_queue: Vec::new(),
            pending: Vec::new(),
            next_serial: 0,
            submissions: 0,
            completions: 0,
            retried_submissions: 0,
            failed_scratch_allocations: 0,
        }
    }

    pub fn source_extent(&self) -> SourceExtent {
        self.extent
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Acquire-or-request a tile. Never blocks and never touches the GPU;
    /// a tile that cannot be scheduled yet simply stays requested.
    pub fn acquire(&mut self, region: NormalizedRegion, now: Instant) -> TileRef {
        let id = TileId::from_region(region, self.extent);

        if let Some(tile) = self.active.get_mut(&id) {
            tile.time_last_used = now;
            return TileRef {
                id,
                serial: tile.serial,
            };
        }

        if let Some(mut tile) = self.idle.remove(&id) {
            tile.idle = false;
            tile.deleted = false;
            tile.reference_count += 1;
            tile.time_last_used = now;
            let serial = tile.serial;
            let needs_request = tile.state == TileState::Empty;
            let previous = self.active.insert(id, tile);
            assert!(
                previous.is_none(),
                "tile present in both registries during idle promotion"
            );
            if needs_request {
                self.request(id);
            }
            return TileRef { id, serial };
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let tile = TileData {
            region,
            serial,
            state: TileState::Empty,
            height_range: None,
            texture_slot: None,
            reference_count: 1,
            idle: false,
            deleted: false,
            queued: false,
            time_last_used: now,
            time_requested: None,
            time_processed: None,
        };
        let previous = self.active.insert(id, tile);
        assert!(
            previous.is_none(),
            "duplicate tile id inserted into active registry"
        );
        self.request(id);
        TileRef { id, serial }
    }

    /// Advance the pipeline one tick: demote and expire stale tiles,
    /// schedule requested reductions, reap completed ones.
    pub fn update(&mut self, now: Instant) {
        self.sweep(now);
        self.schedule(now);
        self.reap(now);
    }

    pub fn state(&self, reference: TileRef) -> Option<TileState> {
        self.lookup(reference).map(|tile| tile.state)
    }

    /// `Some` only once the reduction has completed.
    pub fn height_range(&self, reference: TileRef) -> Option<HeightRange> {
        self.lookup(reference).and_then(|tile| tile.height_range)
    }

    pub fn texture_slot(&self, reference: TileRef) -> Option<u32> {
        self.lookup(reference).and_then(|tile| tile.texture_slot)
    }

    pub fn region(&self, reference: TileRef) -> Option<NormalizedRegion> {
        self.lookup(reference).map(|tile| tile.region)
    }

    /// When the tile was handed a texture slot and entered the queue.
    pub fn requested_at(&self, reference: TileRef) -> Option<Instant> {
        self.lookup(reference).and_then(|tile| tile.time_requested)
    }

    /// When the tile's reduction result was reaped.
    pub fn processed_at(&self, reference: TileRef) -> Option<Instant> {
        self.lookup(reference).and_then(|tile| tile.time_processed)
    }

    pub fn is_active(&self, reference: TileRef) -> bool {
        self.active
            .get(&reference.id)
            .is_some_and(|tile| tile.serial == reference.serial)
    }

    pub fn is_idle(&self, reference: TileRef) -> bool {
        self.idle
            .get(&reference.id)
            .is_some_and(|tile| tile.serial == reference.serial)
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            active_tiles: self.active.len(),
            idle_tiles: self.idle.len(),
            queued_requests: self.request_queue.len(),
            pending_reductions: self.pending.len(),
            scratch_live: self.scratch_pool.live_count(),
            scratch_available: self.scratch_pool.available_count(),
            scratch_checked_out: self.scratch_pool.checked_out_count(),
            descriptor_slots_used: self.scratch_pool.descriptor_slots_used(),
            readback_slots_total: self.readback_slots.len(),
            readback_slots_free: self.free_readback_slots.len(),
            submissions: self.submissions,
            completions: self.completions,
            retried_submissions: self.retried_submissions,
            failed_scratch_allocations: self.failed_scratch_allocations,
        }
    }

    pub fn free_texture_slot_indices(&self) -> &[u32] {
        &self.free_texture_slots
    }

    fn lookup(&self, reference: TileRef) -> Option<&TileData> {
        let tile = self
            .active
            .get(&reference.id)
            .or_else(|| self.idle.get(&reference.id))?;
        if tile.serial != reference.serial {
            return None;
        }
        Some(tile)
    }

    fn tile_mut(&mut self, id: TileId) -> Option<&mut TileData> {
        if self.active.contains_key(&id) {
            self.active.get_mut(&id)
        } else {
            self.idle.get_mut(&id)
        }
    }

    fn request(&mut self, id: TileId) {
        let tile = self
            .active
            .get_mut(&id)
            .expect("requested tile missing from active registry");
        assert_eq!(tile.state, TileState::Empty, "re-request of a non-empty tile");
        tile.state = TileState::Requested;
        tile.time_requested = None;
        if !tile.queued {
            tile.queued = true;
            self.request_queue.push(id);
        }
    }

    // Eviction sweeper. Mark-then-sweep so no map is mutated while it is
    // being walked.
    fn sweep(&mut self, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        let mut to_demote = Vec::new();
        for (id, tile) in &self.active {
            if now.duration_since(tile.time_last_used) > idle_timeout {
                to_demote.push(*id);
            }
        }
        for id in to_demote {
            self.demote(id);
        }

        let expire_timeout = self.config.expire_timeout;
        let mut to_erase = Vec::new();
        for (id, tile) in self.idle.iter_mut() {
            if !tile.deleted && now.duration_since(tile.time_last_used) > expire_timeout {
                tile.deleted = true;
            }
            // In-flight work must drain before its resources can be
            // recycled, so pending tiles wait for the reaper.
            if tile.deleted && tile.state != TileState::Pending {
                to_erase.push(*id);
            }
        }
        for id in to_erase {
            self.erase(id);
        }
    }

    fn demote(&mut self, id: TileId) {
        let mut tile = self
            .active
            .remove(&id)
            .expect("demoted tile missing from active registry");
        assert!(
            tile.reference_count > 0,
            "active tile lost its keep-alive reference"
        );
        tile.reference_count -= 1;
        if tile.state == TileState::Requested {
            // Never got scheduled; regress so nothing is half-submitted.
            tile.state = TileState::Empty;
            tile.queued = false;
            if let Some(slot_index) = tile.texture_slot {
                self.release_slot_scratch(slot_index);
            }
        }
        tile.idle = true;
        let previous = self.idle.insert(id, tile);
        assert!(
            previous.is_none(),
            "tile present in both registries during demotion"
        );
    }

    fn erase(&mut self, id: TileId) {
        let tile = self
            .idle
            .remove(&id)
            .expect("erased tile missing from idle registry");
        assert_eq!(
            tile.reference_count, 0,
            "tile erased while still referenced"
        );
        assert!(tile.idle, "erased tile was not marked idle");
        assert_ne!(tile.state, TileState::Pending, "tile erased while in flight");
        if let Some(slot_index) = tile.texture_slot {
            self.release_slot_scratch(slot_index);
            self.free_texture_slot(slot_index);
        }
    }

    // Request scheduler. Queue order is insertion order; draining is
    // LIFO (newest request first).
    fn schedule(&mut self, now: Instant) {
        // Promotion: assign texture-slot indices to queue entries that
        // still want one, and stamp the request time once per queueing.
        for position in 0..self.request_queue.len() {
            let id = self.request_queue[position];
            let Some(tile) = self.active.get(&id) else {
                continue;
            };
            if tile.state != TileState::Requested || !tile.queued {
                continue;
            }
            let needs_slot = tile.texture_slot.is_none();
            if needs_slot || tile.time_requested.is_none() {
                let slot_index = needs_slot.then(|| self.allocate_texture_slot());
                let tile = self
                    .active
                    .get_mut(&id)
                    .expect("promoted tile disappeared from active registry");
                if let Some(slot_index) = slot_index {
                    tile.texture_slot = Some(slot_index);
                }
                tile.time_requested = Some(now);
            }
        }

        while let Some(id) = self.request_queue.pop() {
            let Some(tile) = self.active.get(&id) else {
                // Demoted (or deleted) before scheduling; drop the entry.
                continue;
            };
            if tile.state != TileState::Requested || !tile.queued {
                continue;
            }
            if !self.try_submit(id) {
                // Backpressure: requeue and stop draining for this tick.
                self.request_queue.push(id);
                break;
            }
        }
    }

    fn try_submit(&mut self, id: TileId) -> bool {
        let request = ScratchRequest::for_tile_texels(id.texel_width(), id.texel_height());
        let slot_index = self
            .active
            .get(&id)
            .and_then(|tile| tile.texture_slot)
            .expect("queued tile has no texture slot");

        let Some(scratch_key) = self.assign_scratch(slot_index, request) else {
            return false;
        };

        let readback_index = match self.free_readback_slots.pop() {
            Some(index) => index,
            None => {
                let index: u32 = self
                    .readback_slots
                    .len()
                    .try_into()
                    .expect("readback slot index overflow");
                let slot = self.runtime.create_slot();
                self.readback_slots.push(slot);
                index
            }
        };

        let scratch = self.scratch_pool.get(scratch_key);
        let slot = &mut self.readback_slots[readback_index as usize];
        if let Err(_error) = self.runtime.submit(scratch, slot, id.texel_rect()) {
            // Scratch stays checked out to the texture slot so the retry
            // next tick takes the reuse path.
            self.free_readback_slots.push(readback_index);
            self.retried_submissions += 1;
            return false;
        }

        let tile = self
            .active
            .get_mut(&id)
            .expect("submitting tile disappeared from active registry");
        tile.state = TileState::Pending;
        tile.queued = false;
        self.pending.push(PendingReduce {
            id,
            readback: readback_index,
        });
        self.submissions += 1;
        true
    }

    /// Reuse the slot's current scratch when it is large enough, else the
    /// smallest sufficient pooled one, else allocate fresh under the
    /// descriptor budget (evicting smallest pooled textures for room).
    /// `None` means backpressure, not an error.
    fn assign_scratch(&mut self, slot_index: u32, request: ScratchRequest) -> Option<ScratchKey> {
        let current = self.texture_slots[slot_index as usize].scratch;
        if let Some(key) = current {
            if self.scratch_pool.get(key).satisfies(request) {
                return Some(key);
            }
            self.scratch_pool.release(key);
            self.texture_slots[slot_index as usize].scratch = None;
        }

        if let Some(key) = self.scratch_pool.find_available(request) {
            self.scratch_pool.check_out(key);
            self.texture_slots[slot_index as usize].scratch = Some(key);
            return Some(key);
        }

        if !self.scratch_pool.make_room(request.descriptor_slot_cost()) {
            return None;
        }
        match self.runtime.create_scratch(request) {
            Ok(scratch) => {
                let key = self.scratch_pool.insert_checked_out(scratch);
                self.texture_slots[slot_index as usize].scratch = Some(key);
                Some(key)
            }
            Err(_error) => {
                self.failed_scratch_allocations += 1;
                None
            }
        }
    }

    // Completion reaper. Walked tail-first so finalized positions come
    // out in descending order and stay valid while being removed.
    fn reap(&mut self, now: Instant) {
        self.runtime.poll_device();

        let mut signaled_readbacks = Vec::new();
        let mut finalized_positions = Vec::new();
        for position in (0..self.pending.len()).rev() {
            let entry = self.pending[position];
            let status = self
                .runtime
                .poll_slot(&mut self.readback_slots[entry.readback as usize]);
            match status {
                SlotStatus::NotSignaled => continue,
                SlotStatus::Signaled => {
                    let result = self
                        .runtime
                        .take_result(&mut self.readback_slots[entry.readback as usize]);
                    match result {
                        Ok(range) => self.finalize(entry.id, range, now),
                        Err(_error) => self.regress(entry.id),
                    }
                }
                SlotStatus::Lost => self.regress(entry.id),
            }
            signaled_readbacks.push(entry.readback);
            finalized_positions.push(position);
        }

        // Batch reset, then recycle each pair exactly once.
        for readback in signaled_readbacks {
            self.runtime
                .reset_slot(&mut self.readback_slots[readback as usize]);
            debug_assert!(
                !self.free_readback_slots.contains(&readback),
                "readback slot recycled twice in one tick"
            );
            self.free_readback_slots.push(readback);
        }
        // Positions were collected high-to-low, so removal stays valid.
        for position in finalized_positions {
            self.pending.remove(position);
        }
    }

    fn finalize(&mut self, id: TileId, range: HeightRange, now: Instant) {
        let Some(tile) = self.tile_mut(id) else {
            panic!("pending tile missing from both registries");
        };
        assert_eq!(tile.state, TileState::Pending, "finalized tile not pending");
        tile.state = TileState::Available;
        tile.height_range = Some(range);
        tile.time_processed = Some(now);
        let slot_index = tile
            .texture_slot
            .expect("pending tile has no texture slot");
        self.release_slot_scratch(slot_index);
        self.completions += 1;
    }

    /// A lost or unreadable submission for an active tile falls back to
    /// the retry path. An idle tile regresses to `Empty` and gives its
    /// resources back instead: the scheduler drain skips non-active
    /// tiles, so a queue entry would go stale, and re-acquisition only
    /// re-requests `Empty` tiles.
    fn regress(&mut self, id: TileId) {
        let active = self.active.contains_key(&id);
        let Some(tile) = self.tile_mut(id) else {
            panic!("pending tile missing from both registries");
        };
        assert_eq!(tile.state, TileState::Pending, "regressed tile not pending");
        if active {
            tile.state = TileState::Requested;
            tile.queued = true;
            tile.time_requested = None;
            self.request_queue.push(id);
        } else {
            tile.state = TileState::Empty;
            tile.queued = false;
            let slot_index = tile
                .texture_slot
                .expect("pending tile has no texture slot");
            self.release_slot_scratch(slot_index);
        }
        self.retried_submissions += 1;
    }

    fn allocate_texture_slot(&mut self) -> u32 {
        let index = match self.free_texture_slots.pop() {
            Some(index) => index,
            None => {
                let index: u32 = self
                    .texture_slots
                    .len()
                    .try_into()
                    .expect("texture slot index overflow");
                self.texture_slots.push(TextureSlot::default());
                self.slot_occupancy.push(false);
                index
            }
        };
        let mut occupied = self
            .slot_occupancy
            .get_mut(index as usize)
            .expect("texture slot occupancy out of bounds");
        assert!(!*occupied, "texture slot allocated twice");
        *occupied = true;
        index
    }

    fn free_texture_slot(&mut self, index: u32) {
        let mut occupied = self
            .slot_occupancy
            .get_mut(index as usize)
            .expect("texture slot occupancy out of bounds");
        assert!(*occupied, "texture slot freed twice");
        *occupied = false;
        drop(occupied);
        self.free_texture_slots.push(index);
    }

    fn release_slot_scratch(&mut self, slot_index: u32) {
        if let Some(key) = self.texture_slots[slot_index as usize].scratch.take() {
            self.scratch_pool.release(key);
        }
    }
}

mod gpu;
mod runtime;
mod scratch;
mod tile_id;

pub use gpu::{ReadbackSlot, ScratchImage, WgpuReduceRuntime};

#[cfg(test)]
mod wgsl_tests;
