//! Map providers: where tile pixels come from.
//!
//! A provider tells the loader, for every tile key, which of three sources
//! to use and how to treat the result:
//!
//! - composed from child tiles ([`MapProvider::tile_children`])
//! - painted algorithmically ([`MapProvider::painter`])
//! - fetched as an encoded byte stream ([`MapProvider::fetch`])
//!
//! plus the offline sub-path, persistence format and dim settings.
//!
//! # Implementations
//!
//! - [`HttpProvider`]: URL template (`{z}/{x}/{y}`) fetched with `reqwest`
//! - [`DownsampleProvider`]: composes zooms below a native minimum from four
//!   finer tiles of an inner provider
//! - [`LayeredProvider`]: stacks the tiles of several providers into one

mod compose;
mod http;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, RgbaImage};

use crate::error::{SourceError, TileError};
use crate::raster::DimSettings;
use crate::tile::{ChildSlot, TileKey};

pub use compose::{DownsampleProvider, LayeredProvider};
pub use http::{HttpProvider, DEFAULT_USER_AGENT};

/// Default edge length of a tile in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default maximum zoom level.
pub const DEFAULT_MAX_ZOOM: u8 = 19;

/// One child of a composed tile.
#[derive(Clone)]
pub struct ChildSpec {
    pub key: TileKey,

    /// Provider that loads the child
    pub provider: Arc<dyn MapProvider>,

    /// Region of the parent the child is drawn into
    pub slot: ChildSlot,
}

impl std::fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpec")
            .field("key", &self.key)
            .field("provider", &self.provider.id())
            .field("slot", &self.slot)
            .finish()
    }
}

/// Synthesizes tile pixels without a byte stream, e.g. hill shading.
pub trait TilePainter: Send + Sync {
    /// Paint the tile for `key` with edge length `tile_size`.
    fn paint(&self, key: &TileKey, tile_size: u32) -> Result<RgbaImage, TileError>;
}

/// Source of map tiles.
///
/// Only [`id`](MapProvider::id) and [`fetch`](MapProvider::fetch) are
/// required; everything else has the defaults of a plain online provider.
#[async_trait]
pub trait MapProvider: Send + Sync {
    /// Unique provider id, the first part of every tile key
    fn id(&self) -> &str;

    fn tile_size(&self) -> u32 {
        DEFAULT_TILE_SIZE
    }

    /// Directory of this provider under the offline cache root
    fn offline_path(&self) -> &str {
        self.id()
    }

    /// Format offline files are stored in
    fn image_format(&self) -> ImageFormat {
        ImageFormat::Png
    }

    fn allows_offline(&self) -> bool {
        true
    }

    fn dim(&self) -> DimSettings {
        DimSettings::none()
    }

    fn min_zoom(&self) -> u8 {
        0
    }

    fn max_zoom(&self) -> u8 {
        DEFAULT_MAX_ZOOM
    }

    /// Children to compose the tile from, `None` when the tile is loaded
    /// directly.
    fn tile_children(&self, _key: &TileKey) -> Option<Vec<ChildSpec>> {
        None
    }

    fn painter(&self) -> Option<&dyn TilePainter> {
        None
    }

    /// The URL a tile is fetched from, for diagnostics.
    fn tile_url(&self, _key: &TileKey) -> Option<String> {
        None
    }

    /// Fetch the encoded image bytes of a tile.
    async fn fetch(&self, key: &TileKey) -> Result<Bytes, SourceError>;
}
