//! Asynchronous tile loading.
//!
//! # Architecture
//!
//! ```text
//!   viewport ──push_back──▶ ┌──────────────┐ ◀──push_front── child tiles
//!                           │ WaitingQueue │
//!                           └──────┬───────┘
//!                                  │ pop (first)
//!                   ┌──────────────┼──────────────┐
//!                   ▼              ▼              ▼
//!              ┌─────────┐    ┌─────────┐    ┌─────────┐
//!              │ worker  │    │ worker  │    │ worker  │   WorkerPool
//!              └────┬────┘    └────┬────┘    └────┬────┘
//!                   │ spawn        │              │
//!                   ▼              ▼              ▼
//!              TileImageLoader: offline → children → painter → stream
//!                   │
//!                   ▼
//!         TileImageCache, ErrorTileCache, EventBus
//! ```
//!
//! # Components
//!
//! - [`WaitingQueue`]: Deque of tiles waiting for a worker, de-duplicated by key
//! - [`WorkerPool`]: Fixed number of workers draining the queue
//! - [`TileImageLoader`]: Loads one claimed tile and finalizes it
//! - [`EventBus`]: Broadcast of tile lifecycle events

mod events;
mod pool;
mod queue;
mod task;

use std::sync::Arc;

use crate::raster::TileImageCache;
use crate::tile::{ErrorTileCache, TileCache};

pub use events::{EventBus, TileEvent, TileEventKind, DEFAULT_EVENT_CAPACITY};
pub use pool::{WorkerPool, DEFAULT_WORKER_COUNT};
pub use queue::WaitingQueue;
pub use task::{LoadOutcome, TileImageLoader};

/// Everything a loader needs, shared by all workers.
pub struct LoaderContext {
    pub tile_cache: Arc<TileCache>,
    pub error_cache: Arc<ErrorTileCache>,
    pub image_cache: Arc<TileImageCache>,
    pub queue: Arc<WaitingQueue>,
    pub events: EventBus,
}
