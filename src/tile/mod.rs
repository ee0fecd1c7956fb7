//! Tile model layer.
//!
//! This module defines what a map tile is and how tiles are cached by
//! identity, independently of how their images are produced.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Viewport                 │
//! └────────────────────┬────────────────────┘
//!                      │ key
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │               TileCache                 │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  Tile        │  │  Composition    │  │
//! │  │  (state,     │  │  (children →    │  │
//! │  │   image)     │  │   parent image) │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ tile
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │          Loader (WaitingQueue)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileKey`]: Identity of a tile (provider, zoom, column, row, custom part)
//! - [`Tile`]: Shared per-tile state: loading flag, error, image, parent/children
//! - [`TileCache`]: FIFO cache of tiles by key with family-aware eviction
//! - [`ErrorTileCache`]: LRU cache of keys that failed permanently
//! - [`CompositionResult`]: Outcome of composing a parent from its children
//!
//! # Example
//!
//! ```
//! use map_tile_pipeline::tile::{TileCache, TileKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = TileCache::with_capacity(500, 10);
//!     let key = TileKey::new("osm", 5, 3, 7);
//!
//!     assert!(cache.get(&key).await.is_none());
//!     assert_eq!(key.to_string(), "osm-5-3-7");
//! }
//! ```

mod cache;
mod composition;
mod key;
mod model;

pub use cache::{
    ErrorTileCache, TileCache, DEFAULT_ERROR_CACHE_CAPACITY, DEFAULT_EVICTION_SLACK,
    DEFAULT_TILE_CACHE_CAPACITY,
};
pub use composition::CompositionResult;
pub use key::{offline_path, TileKey, PART_SUFFIX};
pub use model::{ChildSlot, OverlayState, Tile};
