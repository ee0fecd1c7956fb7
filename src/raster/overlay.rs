//! Cache for overlay images (track and route drawings).
//!
//! Overlay images churn independently of base-map tiles, so they get their
//! own bound and never evict tile images or vice versa. There is no offline
//! persistence and no dimming.

use tokio::sync::RwLock;
use tracing::debug;

use crate::fifo::FifoCache;
use crate::tile::DEFAULT_EVICTION_SLACK;

use super::TileImage;

/// Default number of overlay images kept in memory.
pub const DEFAULT_OVERLAY_CACHE_CAPACITY: usize = 300;

/// FIFO-bounded cache of overlay images by overlay key.
pub struct OverlayImageCache {
    images: RwLock<FifoCache<String, TileImage>>,
}

impl OverlayImageCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OVERLAY_CACHE_CAPACITY, DEFAULT_EVICTION_SLACK)
    }

    pub fn with_capacity(capacity: usize, slack: usize) -> Self {
        Self {
            images: RwLock::new(FifoCache::new(capacity, slack)),
        }
    }

    pub async fn add(&self, key: impl Into<String>, image: TileImage) {
        let mut images = self.images.write().await;
        let evicted = images.insert_and_evict(key.into(), image);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted overlay images");
        }
    }

    pub async fn get(&self, key: &str) -> Option<TileImage> {
        self.images.read().await.get(&key.to_string()).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<TileImage> {
        self.images.write().await.remove(&key.to_string())
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }

    /// Release every overlay image.
    pub async fn dispose(&self) {
        self.images.write().await.drain();
    }
}

impl Default for OverlayImageCache {
    fn default() -> Self {
        Self::new()
    }
}
