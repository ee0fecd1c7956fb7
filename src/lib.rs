//! # Map Tile Pipeline
//!
//! Acquisition and caching of slippy-map tiles.
//!
//! Tiles are addressed by provider, zoom and column/row. The pipeline loads
//! them from an offline disk cache, composes them from child tiles, paints
//! them locally or streams them from a tile server, and keeps bounded
//! in-memory caches of tiles, decoded images and failures.
//!
//! ## Features
//!
//! - **Offline cache**: Tiles are written to `root/provider/z/x/y.ext` and read
//!   back before any network access; incomplete composites use a `-part` file
//! - **Composition**: Low zoom tiles can be built from their higher zoom
//!   quadrants, and layered providers stack several sources into one tile
//! - **Bounded caches**: FIFO tile and image caches with batch eviction, and
//!   an LRU cache of failures so broken tiles are not requested again
//! - **Worker pool**: A fixed number of async workers drain a de-duplicated
//!   waiting queue, children always ahead of viewport requests
//! - **Dimming**: Images can be blended towards a color on a render thread
//!
//! ## Architecture
//!
//! - [`tile`] - Tile model, keys, the tile cache and the error cache
//! - [`raster`] - Decoded images, the image and overlay caches, dimming
//! - [`provider`] - Map providers: HTTP, downsampled and layered
//! - [`loader`] - Waiting queue, workers, the per-tile loader and events
//! - [`manager`] - The [`TileManager`] tying everything together
//! - [`config`] - Library and command-line configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use map_tile_pipeline::{HttpProvider, LoaderConfig, MapProvider, TileKey, TileManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider: Arc<dyn MapProvider> = Arc::new(HttpProvider::new(
//!         "osm",
//!         "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
//!     )?);
//!
//!     let manager = TileManager::new(LoaderConfig::new("/tmp/tiles"))?;
//!     let image = manager.load(TileKey::new("osm", 5, 3, 7), &provider).await?;
//!     println!("{}x{}", image.width(), image.height());
//!
//!     manager.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
mod fifo;
pub mod loader;
pub mod manager;
pub mod provider;
pub mod raster;
pub mod tile;

// Re-export commonly used types
pub use config::{parse_color, CheckConfig, Cli, Command, FetchConfig, LoaderConfig, TileRange};
pub use error::{SourceError, TileError};
pub use loader::{
    EventBus, LoadOutcome, TileEvent, TileEventKind, TileImageLoader, WaitingQueue, WorkerPool,
    DEFAULT_WORKER_COUNT,
};
pub use manager::{RequestStatus, TileManager};
pub use provider::{
    ChildSpec, DownsampleProvider, HttpProvider, LayeredProvider, MapProvider, TilePainter,
    DEFAULT_TILE_SIZE,
};
pub use raster::{
    DimSettings, OverlayImageCache, RenderExecutor, SourceImage, TileImage, TileImageCache,
    DIM_LEVEL_NONE,
};
pub use tile::{
    offline_path, ChildSlot, ErrorTileCache, OverlayState, Tile, TileCache, TileKey, PART_SUFFIX,
};
