//! Core types shared by the cache, the scheduler and the session

use serde::{Deserialize, Serialize};

use crate::pool::PixelBuffer;

/// Zero-based page index into a document
pub type PageIndex = usize;

/// Width and height in pixels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PageSize {
    pub width: u32,
    pub height: u32,
}

impl PageSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height, `1.0` for degenerate sizes
    #[must_use]
    pub fn aspect_ratio(self) -> f32 {
        if self.is_empty() {
            return 1.0;
        }
        self.width as f32 / self.height as f32
    }

    /// Height that keeps this size's aspect ratio at the given width (at least 1)
    #[must_use]
    pub fn height_for_width(self, width: u32) -> u32 {
        ((width as f32 / self.aspect_ratio()) as u32).max(1)
    }

    /// Size scaled by a quality multiplier, never collapsing to zero
    #[must_use]
    pub fn scaled(self, multiplier: f32) -> Self {
        if (multiplier - 1.0).abs() < f32::EPSILON {
            return self;
        }
        Self {
            width: ((self.width as f32 * multiplier) as u32).max(1),
            height: ((self.height as f32 * multiplier) as u32).max(1),
        }
    }
}

/// Resolution multiplier applied to every target size of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderQuality {
    #[default]
    Normal,
    High,
    Ultra,
}

impl RenderQuality {
    #[must_use]
    pub fn multiplier(self) -> f32 {
        match self {
            RenderQuality::Normal => 1.0,
            RenderQuality::High => 2.0,
            RenderQuality::Ultra => 3.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenderQuality::Normal => "normal",
            RenderQuality::High => "high",
            RenderQuality::Ultra => "ultra",
        }
    }
}

/// Rendered raster of one page.
///
/// Pixels are RGBA8, tightly packed (`width * 4` bytes per row). Once
/// rendered an image is shared behind an `Arc` between the cache and every
/// caller that received it; nobody mutates it afterwards. When the last
/// reference goes away the pixel buffer returns to the pool it came from.
pub struct PageImage {
    page: PageIndex,
    buffer: PixelBuffer,
}

impl PageImage {
    #[must_use]
    pub fn new(page: PageIndex, buffer: PixelBuffer) -> Self {
        Self { page, buffer }
    }

    #[must_use]
    pub fn page(&self) -> PageIndex {
        self.page
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    #[must_use]
    pub fn size(&self) -> PageSize {
        PageSize::new(self.width(), self.height())
    }

    /// Raw RGBA pixels
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Size of the pixel data in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.buffer.as_slice().len()
    }
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("page", &self.page)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("pooled", &self.buffer.is_pooled())
            .finish_non_exhaustive()
    }
}
