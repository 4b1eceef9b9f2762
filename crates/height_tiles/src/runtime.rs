//! Seam between the tile cache and the compute backend that performs
//! the per-tile min/max reduction.
//!
//! The cache is generic over [`ReduceRuntime`] so its registry, pooling
//! and scheduling logic can be exercised without a GPU device. The wgpu
//! implementation lives in [`crate::gpu`].

use std::fmt;

use height_protocol::{HeightRange, TexelRect};

/// Dimensions a scratch texture must provide to reduce one tile:
/// smallest power-of-two-aligned extent covering the tile's texel rect,
/// with a mip chain reaching 1x1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRequest {
    pub width: u32,
    pub height: u32,
    pub mip_level_count: u32,
}

impl ScratchRequest {
    pub fn for_tile_texels(width: u32, height: u32) -> Self {
        assert!(width > 0 && height > 0, "tile texel extent must be nonzero");
        let width = width.next_power_of_two();
        let height = height.next_power_of_two();
        let mip_level_count = width.max(height).ilog2() + 1;
        Self {
            width,
            height,
            mip_level_count,
        }
    }

    /// Descriptor slots this scratch consumes: one storage view per mip.
    pub fn descriptor_slot_cost(self) -> u32 {
        self.mip_level_count
    }
}

pub trait ScratchExtent {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn mip_level_count(&self) -> u32;

    fn satisfies(&self, request: ScratchRequest) -> bool {
        self.width() >= request.width
            && self.height() >= request.height
            && self.mip_level_count() >= request.mip_level_count
    }

    fn descriptor_slot_cost(&self) -> u32 {
        self.mip_level_count()
    }
}

/// Non-blocking completion status of one in-flight reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotSignaled,
    Signaled,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScratchCreateError {
    OutOfMemory { message: String },
    Validation { message: String },
    Internal { message: String },
}

impl fmt::Display for ScratchCreateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchCreateError::OutOfMemory { message } => {
                write!(formatter, "scratch texture allocation out of memory: {message}")
            }
            ScratchCreateError::Validation { message } => {
                write!(formatter, "scratch texture allocation rejected: {message}")
            }
            ScratchCreateError::Internal { message } => {
                write!(formatter, "scratch texture allocation failed: {message}")
            }
        }
    }
}

impl std::error::Error for ScratchCreateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceSubmitError {
    Rejected { reason: &'static str },
}

impl fmt::Display for ReduceSubmitError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceSubmitError::Rejected { reason } => {
                write!(formatter, "reduction submission rejected: {reason}")
            }
        }
    }
}

impl std::error::Error for ReduceSubmitError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceReadbackError {
    SlotNotSignaled,
    MapFailed { message: String },
}

impl fmt::Display for ReduceReadbackError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceReadbackError::SlotNotSignaled => {
                write!(formatter, "readback requested before slot signaled")
            }
            ReduceReadbackError::MapFailed { message } => {
                write!(formatter, "readback buffer map failed: {message}")
            }
        }
    }
}

impl std::error::Error for ReduceReadbackError {}

/// Compute backend contract.
///
/// Submitted work always runs to completion; a slot must not be reused
/// until [`ReduceRuntime::poll_slot`] has reported it signaled (or lost)
/// and it has been reset. Nothing here blocks the calling thread.
pub trait ReduceRuntime {
    type Scratch: ScratchExtent;
    type Slot;

    fn create_scratch(&mut self, request: ScratchRequest)
    -> Result<Self::Scratch, ScratchCreateError>;

    fn create_slot(&mut self) -> Self::Slot;

    /// Record and submit the full mip-chain reduction of `source_rect`
    /// through `scratch`, signaling `slot` on completion.
    fn submit(
        &mut self,
        scratch: &Self::Scratch,
        slot: &mut Self::Slot,
        source_rect: TexelRect,
    ) -> Result<(), ReduceSubmitError>;

    /// Drive asynchronous completion forward without waiting. Called once
    /// per tick before slots are polled.
    fn poll_device(&mut self);

    fn poll_slot(&mut self, slot: &mut Self::Slot) -> SlotStatus;

    /// Read the (min, max) result out of a signaled slot. Leaves the slot
    /// signaled; callers reset it afterwards.
    fn take_result(&mut self, slot: &mut Self::Slot) -> Result<HeightRange, ReduceReadbackError>;

    /// Return a drained slot to a reusable state.
    fn reset_slot(&mut self, slot: &mut Self::Slot);
}
