//! Tile manager: owner of all caches, the queue and the workers.
//!
//! The TileManager plays the map viewport's part in the pipeline:
//! - Look up or create tiles by key
//! - Queue tiles that need loading, skipping known failures
//! - Hand out cached images
//! - Reset everything on zoom or provider change
//! - Tear everything down on dispose
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TileManager                            │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐  │
//! │  │  TileCache   │  │ ErrorTileCache │  │ OverlayImageCache   │  │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘  │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐  │
//! │  │ WaitingQueue │─▶│   WorkerPool   │─▶│   TileImageCache    │  │
//! │  └──────────────┘  └────────────────┘  │  (+ RenderExecutor) │  │
//! │                                        └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::error::TileError;
use crate::loader::{EventBus, LoaderContext, TileEvent, WaitingQueue, WorkerPool};
use crate::provider::MapProvider;
use crate::raster::{OverlayImageCache, RenderExecutor, TileImage, TileImageCache};
use crate::tile::{ErrorTileCache, Tile, TileCache, TileKey};

// =============================================================================
// Request Outcome
// =============================================================================

/// What [`TileManager::request`] did with a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The tile was put in the waiting queue
    Queued,

    /// The tile already has an image
    Ready,

    /// The tile is being loaded or already waiting
    Pending,

    /// The tile failed before and is not requested again
    Failed,
}

// =============================================================================
// Tile Manager
// =============================================================================

/// Lifecycle owner of the tile pipeline.
///
/// Create one per map view with [`TileManager::new`] (inside a Tokio
/// runtime) and call [`TileManager::dispose`] when the view goes away.
pub struct TileManager {
    config: LoaderConfig,
    ctx: Arc<LoaderContext>,
    overlay_cache: Arc<OverlayImageCache>,
    render: Arc<RenderExecutor>,
    pool: Mutex<Option<WorkerPool>>,
}

impl TileManager {
    /// Create the caches, start the render thread and the workers.
    pub fn new(config: LoaderConfig) -> Result<Self, TileError> {
        config.validate().map_err(|message| TileError::Unexpected {
            message: format!("invalid loader configuration: {}", message),
        })?;

        let render = Arc::new(RenderExecutor::start()?);

        let ctx = Arc::new(LoaderContext {
            tile_cache: Arc::new(TileCache::with_capacity(
                config.tile_cache_capacity,
                config.eviction_slack,
            )),
            error_cache: Arc::new(ErrorTileCache::with_capacity(config.error_cache_capacity)),
            image_cache: Arc::new(TileImageCache::with_capacity(
                &config.cache_root,
                render.clone(),
                config.image_cache_capacity,
                config.eviction_slack,
            )),
            queue: Arc::new(WaitingQueue::new()),
            events: EventBus::with_capacity(config.event_capacity),
        });

        let overlay_cache = Arc::new(OverlayImageCache::with_capacity(
            config.overlay_cache_capacity,
            config.eviction_slack,
        ));

        let pool = WorkerPool::start(ctx.clone(), config.workers);

        info!(
            cache_root = %config.cache_root.display(),
            workers = config.workers,
            "Tile manager started"
        );

        Ok(Self {
            config,
            ctx,
            overlay_cache,
            render,
            pool: Mutex::new(Some(pool)),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.ctx.tile_cache
    }

    pub fn error_cache(&self) -> &Arc<ErrorTileCache> {
        &self.ctx.error_cache
    }

    pub fn image_cache(&self) -> &Arc<TileImageCache> {
        &self.ctx.image_cache
    }

    pub fn overlay_cache(&self) -> &Arc<OverlayImageCache> {
        &self.overlay_cache
    }

    pub fn queue(&self) -> &Arc<WaitingQueue> {
        &self.ctx.queue
    }

    /// Listen to tile lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.ctx.events.subscribe()
    }

    // =========================================================================
    // Viewport operations
    // =========================================================================

    /// The tile for a key, created and cached when absent.
    pub async fn get_tile(&self, key: TileKey, provider: &Arc<dyn MapProvider>) -> Arc<Tile> {
        let (tile, created) = self
            .ctx
            .tile_cache
            .get_or_insert_with(key.clone(), || Tile::new(key, provider.clone()))
            .await;

        if created {
            self.ctx.image_cache.set_offline_image_availability(&tile).await;
        }
        tile
    }

    /// Make sure a tile is loaded or being loaded.
    pub async fn request(
        &self,
        key: TileKey,
        provider: &Arc<dyn MapProvider>,
    ) -> (Arc<Tile>, RequestStatus) {
        let tile = self.get_tile(key, provider).await;
        let status = self.request_tile(&tile).await;
        (tile, status)
    }

    async fn request_tile(&self, tile: &Arc<Tile>) -> RequestStatus {
        if tile.has_image() {
            return RequestStatus::Ready;
        }
        if tile.is_loading_error() || self.ctx.error_cache.contains(tile.key()).await {
            return RequestStatus::Failed;
        }
        if tile.is_loading() {
            return RequestStatus::Pending;
        }

        tile.mark_queued();
        if self.ctx.queue.push_back(tile.clone()) {
            debug!(tile = %tile.key(), "Queued tile");
            RequestStatus::Queued
        } else {
            RequestStatus::Pending
        }
    }

    /// Request a tile and wait until it is finalized.
    pub async fn load(
        &self,
        key: TileKey,
        provider: &Arc<dyn MapProvider>,
    ) -> Result<TileImage, TileError> {
        let tile = self.get_tile(key, provider).await;
        let mut finished = tile.subscribe();

        loop {
            if let Some(image) = tile.image() {
                return Ok(image);
            }
            if let Some(error) = self.failure(&tile).await {
                return Err(error);
            }
            if self.ctx.queue.is_closed() {
                return Err(TileError::Cancelled);
            }

            self.request_tile(&tile).await;

            if finished.changed().await.is_err() {
                return Err(TileError::Cancelled);
            }
        }
    }

    async fn failure(&self, tile: &Tile) -> Option<TileError> {
        let message = match tile.loading_error() {
            Some(message) => message,
            None => self.ctx.error_cache.get(tile.key()).await?,
        };
        Some(TileError::Failed {
            key: tile.key().to_string(),
            message,
        })
    }

    /// The displayable image of a tile, if it was loaded.
    pub async fn tile_image(&self, key: &TileKey) -> Option<TileImage> {
        let tile = self.ctx.tile_cache.get(key).await?;
        match self.ctx.image_cache.get_tile_image(&tile).await {
            Some(image) => Some(image),
            None => tile.image(),
        }
    }

    /// Reset after a zoom or provider change.
    ///
    /// Stops all loading, drops every queued and cached tile and forgets
    /// failures so they are retried on the next request.
    pub async fn reset(&self) {
        let dropped = self.ctx.queue.clear().len();
        self.ctx.tile_cache.stop_loading_tiles().await;
        self.ctx.tile_cache.remove_all().await;
        self.ctx.error_cache.clear().await;
        self.ctx.events.emit(TileEvent::queue_reset());
        debug!(dropped, "Tile queue reset");
    }

    /// Forget all overlay state of tiles and the overlay images.
    pub async fn reset_overlays(&self) {
        self.ctx.tile_cache.reset_overlays().await;
        self.overlay_cache.dispose().await;
    }

    /// Drop composed tiles, e.g. after a provider's layers changed.
    pub async fn remove_parent_tiles(&self) {
        self.ctx.tile_cache.remove_parent_tiles().await;
    }

    /// Stop the workers and the render thread and release every cached
    /// image.
    pub async fn dispose(&self) {
        self.ctx.queue.close();
        self.ctx.queue.clear();
        self.ctx.tile_cache.stop_loading_tiles().await;

        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }

        self.ctx.tile_cache.remove_all().await;
        self.ctx.error_cache.clear().await;
        self.ctx.image_cache.dispose().await;
        self.overlay_cache.dispose().await;
        self.render.shutdown();

        info!("Tile manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.lock().is_none()
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.abort();
        }
    }
}
