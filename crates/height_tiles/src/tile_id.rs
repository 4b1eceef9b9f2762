//! Tile identity derivation.
//!
//! A tile is identified by the texel-space bounding box its normalized
//! region covers in the source heightfield. Two requests whose regions
//! round to the same texel box are the same tile, regardless of call
//! order or the exact floating point offsets they were built from.

use height_protocol::{NormalizedRegion, SourceExtent, TexelRect};
use static_assertions::const_assert;

/// Largest source edge the id derivation supports. Texel bounds are
/// stored as `i32`, so the extent must stay inside the positive range.
pub const MAX_SOURCE_EDGE: u32 = 1 << 30;

const_assert!(MAX_SOURCE_EDGE <= i32::MAX as u32);

/// TileId:
/// four texel bounds `(x0, y0)` inclusive, `(x1, y1)` exclusive,
/// with `0 <= x0 < x1 <= source_width` and likewise for y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
}

impl TileId {
    pub fn from_region(region: NormalizedRegion, extent: SourceExtent) -> Self {
        assert!(
            extent.width() <= MAX_SOURCE_EDGE && extent.height() <= MAX_SOURCE_EDGE,
            "source extent {}x{} exceeds supported tile id range",
            extent.width(),
            extent.height()
        );
        let (x0, x1) = axis_bounds(region.offset[0], region.size[0], extent.width());
        let (y0, y1) = axis_bounds(region.offset[1], region.size[1], extent.height());
        Self { x0, y0, x1, y1 }
    }

    pub fn texel_rect(self) -> TexelRect {
        TexelRect {
            x: self.x0 as u32,
            y: self.y0 as u32,
            width: (self.x1 - self.x0) as u32,
            height: (self.y1 - self.y0) as u32,
        }
    }

    pub fn texel_width(self) -> u32 {
        (self.x1 - self.x0) as u32
    }

    pub fn texel_height(self) -> u32 {
        (self.y1 - self.y0) as u32
    }
}

fn axis_bounds(offset: f64, size: f64, edge: u32) -> (i32, i32) {
    let edge_f = edge as f64;
    let lo = (offset * edge_f).floor() as i64;
    let hi = ((offset + size) * edge_f).ceil() as i64;
    let lo = lo.clamp(0, edge as i64 - 1);
    let hi = hi.clamp(lo + 1, edge as i64);
    (lo as i32, hi as i32)
}
