use std::fmt;

/// A rectangular region of the source heightfield in normalized
/// coordinates, where (0, 0)..(1, 1) spans the whole field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRegion {
    pub offset: [f64; 2],
    pub size: [f64; 2],
}

impl NormalizedRegion {
    pub fn new(offset: [f64; 2], size: [f64; 2]) -> Self {
        Self { offset, size }
    }
}

/// Texel-space rectangle inside the source heightfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TexelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TexelRect {
    pub fn texel_count(self) -> u64 {
        (self.width as u64) * (self.height as u64)
    }
}

/// Pixel extent of the source heightfield image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceExtent {
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceExtentError {
    ZeroWidth,
    ZeroHeight,
}

impl fmt::Display for SourceExtentError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceExtentError::ZeroWidth => write!(formatter, "source extent width must be at least 1"),
            SourceExtentError::ZeroHeight => {
                write!(formatter, "source extent height must be at least 1")
            }
        }
    }
}

impl std::error::Error for SourceExtentError {}

impl SourceExtent {
    pub fn new(width: u32, height: u32) -> Result<Self, SourceExtentError> {
        if width == 0 {
            return Err(SourceExtentError::ZeroWidth);
        }
        if height == 0 {
            return Err(SourceExtentError::ZeroHeight);
        }
        Ok(Self { width, height })
    }

    pub fn width(self) -> u32 {
        self.width
    }

    pub fn height(self) -> u32 {
        self.height
    }
}

/// Min/max elevation over a tile's source texel region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightRange {
    pub min: f32,
    pub max: f32,
}

impl HeightRange {
    pub fn is_ordered(self) -> bool {
        self.min <= self.max
    }

    pub fn contains(self, height: f32) -> bool {
        self.min <= height && height <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_extent_rejects_zero_dimensions() {
        assert_eq!(SourceExtent::new(0, 4), Err(SourceExtentError::ZeroWidth));
        assert_eq!(SourceExtent::new(4, 0), Err(SourceExtentError::ZeroHeight));
        let extent = SourceExtent::new(4, 8).expect("nonzero extent");
        assert_eq!(extent.width(), 4);
        assert_eq!(extent.height(), 8);
    }

    #[test]
    fn texel_rect_count_does_not_overflow_u32() {
        let rect = TexelRect {
            x: 0,
            y: 0,
            width: u32::MAX,
            height: 2,
        };
        assert_eq!(rect.texel_count(), (u32::MAX as u64) * 2);
    }

    #[test]
    fn height_range_ordering_and_containment() {
        let range = HeightRange { min: -3.0, max: 7.5 };
        assert!(range.is_ordered());
        assert!(range.contains(-3.0));
        assert!(range.contains(7.5));
        assert!(!range.contains(7.6));
    }
}
