//! Decoded tile images and the caches that hold them.
//!
//! # Architecture
//!
//! ```text
//!   bytes / painter pixels
//!            │
//!            ▼
//!   ┌─────────────────┐  save   ┌──────────────────────────────┐
//!   │   SourceImage   │────────▶│  offline cache (one file per │
//!   │ (pixels + raw)  │         │  tile under the cache root)  │
//!   └────────┬────────┘         └──────────────────────────────┘
//!            │ dim (render thread)
//!            ▼
//!   ┌─────────────────┐
//!   │ TileImageCache  │──▶ TileImage handle shared with the Tile
//!   └─────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileImage`]: Cheaply cloneable handle to decoded, display-ready pixels
//! - [`SourceImage`]: Pixels plus the encoded bytes they came from, if any
//! - [`TileImageCache`]: Bounded image cache with offline persistence and dimming
//! - [`OverlayImageCache`]: Bounded image cache for overlay drawings
//! - [`RenderExecutor`]: Dedicated thread running the dimming composite

mod cache;
mod codec;
mod overlay;
mod render;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::{ImageFormat, RgbaImage};

use crate::error::TileError;

pub use cache::{OfflineImage, TileImageCache, DEFAULT_IMAGE_CACHE_CAPACITY};
pub use codec::{decode_first_frame, encode, extension_for};
pub use overlay::{OverlayImageCache, DEFAULT_OVERLAY_CACHE_CAPACITY};
pub use render::{dim_image, RenderExecutor};

// =============================================================================
// Tile Image
// =============================================================================

/// Shared handle to display-ready tile pixels.
///
/// Clones share the same pixel buffer; the buffer is released when the last
/// handle (cache entry, tile, renderer) is dropped.
#[derive(Clone)]
pub struct TileImage {
    inner: Arc<ImageData>,
}

struct ImageData {
    pixels: RgbaImage,
    partial: bool,
}

impl TileImage {
    /// Wrap pixels. `partial` marks a composite with missing children.
    pub fn new(pixels: RgbaImage, partial: bool) -> Self {
        Self {
            inner: Arc::new(ImageData { pixels, partial }),
        }
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.inner.pixels
    }

    pub fn width(&self) -> u32 {
        self.inner.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.pixels.dimensions()
    }

    /// Whether the image was composed although some children were missing.
    pub fn is_partial(&self) -> bool {
        self.inner.partial
    }

    /// Whether both handles share the same pixel buffer.
    pub fn ptr_eq(&self, other: &TileImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TileImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileImage")
            .field("dimensions", &self.dimensions())
            .field("partial", &self.is_partial())
            .finish()
    }
}

// =============================================================================
// Source Image
// =============================================================================

/// A freshly obtained tile image before dimming and caching.
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Decoded pixels
    pub image: RgbaImage,

    /// The bytes the pixels were decoded from, when they came from a stream
    pub encoded: Option<Bytes>,

    /// Format of `encoded`, when it could be recognised
    pub format: Option<ImageFormat>,
}

impl SourceImage {
    /// Decode the first frame of encoded image bytes.
    pub fn decode(bytes: Bytes) -> Result<Self, TileError> {
        let (image, format) = decode_first_frame(&bytes)?;
        Ok(Self {
            image,
            encoded: Some(bytes),
            format: Some(format),
        })
    }

    /// Pixels that have no encoded form, e.g. painted or composed tiles.
    pub fn from_pixels(image: RgbaImage) -> Self {
        Self {
            image,
            encoded: None,
            format: None,
        }
    }
}

// =============================================================================
// Dim Settings
// =============================================================================

/// Level at which a tile is shown unchanged.
pub const DIM_LEVEL_NONE: u8 = 255;

/// How strongly a provider's tiles are blended toward a solid color.
///
/// `level` is the opacity of the tile over the dim color: 255 shows the tile
/// unchanged, 0 shows only the dim color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimSettings {
    pub level: u8,
    pub color: [u8; 3],
}

impl DimSettings {
    pub fn new(level: u8, color: [u8; 3]) -> Self {
        Self { level, color }
    }

    /// No dimming.
    pub fn none() -> Self {
        Self {
            level: DIM_LEVEL_NONE,
            color: [0, 0, 0],
        }
    }

    pub fn is_active(&self) -> bool {
        self.level != DIM_LEVEL_NONE
    }
}

impl Default for DimSettings {
    fn default() -> Self {
        Self::none()
    }
}
