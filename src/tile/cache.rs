//! Tile identity cache and the cache of permanently failing tiles.
//!
//! # Eviction
//!
//! [`TileCache`] evicts in insertion order, lazily on insert, once it grew
//! [`DEFAULT_EVICTION_SLACK`] entries past its capacity. Tiles that are
//! currently loading are never evicted, and neither are children a loading
//! parent still waits for.
//!
//! Parent and child tiles are evicted by family: evicting a parent detaches
//! all of its children and removes the ones that are not loading; evicting a
//! child removes its idle siblings with it. Children that are still loading
//! stay in the cache without a parent and finish as ordinary tiles.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use crate::fifo::FifoCache;

use super::key::TileKey;
use super::model::Tile;

/// Default number of tiles kept in the identity cache.
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 2_000;

/// Default number of entries a cache may overshoot before a batch eviction.
pub const DEFAULT_EVICTION_SLACK: usize = 20;

/// Default number of failed tile keys remembered.
pub const DEFAULT_ERROR_CACHE_CAPACITY: usize = 1_000;

// =============================================================================
// Tile Cache
// =============================================================================

/// Bounded cache mapping tile keys to tiles.
///
/// # Thread Safety
///
/// The cache is shared by the viewport and all loader workers via `Arc`.
pub struct TileCache {
    cache: RwLock<FifoCache<TileKey, Arc<Tile>>>,
}

impl TileCache {
    /// Create a tile cache with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_EVICTION_SLACK)
    }

    /// Create a tile cache holding `capacity` tiles, evicting in batches once
    /// `slack` tiles past capacity.
    pub fn with_capacity(capacity: usize, slack: usize) -> Self {
        Self {
            cache: RwLock::new(FifoCache::new(capacity, slack)),
        }
    }

    /// Add a tile, evicting old tiles when the cache is over its bound.
    pub async fn add(&self, key: TileKey, tile: Arc<Tile>) {
        let mut cache = self.cache.write().await;
        insert_and_evict(&mut cache, key, tile);
    }

    /// Get the cached tile for a key, or create, cache and return a new one.
    ///
    /// Returns the tile and whether it was created by this call.
    pub async fn get_or_insert_with<F>(&self, key: TileKey, create: F) -> (Arc<Tile>, bool)
    where
        F: FnOnce() -> Arc<Tile>,
    {
        if let Some(tile) = self.get(&key).await {
            return (tile, false);
        }

        let mut cache = self.cache.write().await;

        // Another caller may have inserted it between the two locks
        if let Some(tile) = cache.get(&key) {
            return (tile.clone(), false);
        }

        let tile = create();
        insert_and_evict(&mut cache, key, tile.clone());
        (tile, true)
    }

    pub async fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let cache = self.cache.read().await;
        cache.get(key).cloned()
    }

    pub async fn contains(&self, key: &TileKey) -> bool {
        let cache = self.cache.read().await;
        cache.contains(key)
    }

    /// Remove a tile, first clearing its parent/child links.
    pub async fn remove(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let mut cache = self.cache.write().await;
        let tile = cache.remove(key)?;
        detach(&tile);
        Some(tile)
    }

    /// Remove every tile.
    pub async fn remove_all(&self) {
        let mut cache = self.cache.write().await;
        for (_, tile) in cache.drain() {
            detach(&tile);
        }
    }

    /// Remove every tile that has children.
    ///
    /// Needed when the composition layout of a provider changes; the
    /// children stay cached as ordinary tiles. Parents still composing are
    /// kept until they finalize.
    pub async fn remove_parent_tiles(&self) {
        let mut cache = self.cache.write().await;
        let removed = cache.remove_where(|_, tile| tile.has_children() && !tile.is_loading());
        for (_, tile) in &removed {
            detach(tile);
        }
        debug!(removed = removed.len(), "Removed parent tiles");
    }

    /// Reset the overlay state of every cached tile.
    pub async fn reset_overlays(&self) {
        let cache = self.cache.read().await;
        for tile in cache.values() {
            tile.reset_overlay();
        }
    }

    /// Abort every in-flight loading task and clear all loading flags.
    pub async fn stop_loading_tiles(&self) {
        let cache = self.cache.read().await;
        for tile in cache.values() {
            tile.cancel_loading();
        }
    }

    /// Snapshot of all cached tiles, oldest first.
    pub async fn tiles(&self) -> Vec<Arc<Tile>> {
        let cache = self.cache.read().await;
        cache.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.cache.read().await.capacity()
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_and_evict(cache: &mut FifoCache<TileKey, Arc<Tile>>, key: TileKey, tile: Arc<Tile>) {
    cache.insert(key, tile);

    if cache.needs_eviction() {
        let evicted = cache.evict_oldest(|_, tile| is_evictable(tile));
        let count = evicted.len();
        for (_, tile) in evicted {
            evict_family(cache, &tile);
        }
        debug!(evicted = count, remaining = cache.len(), "Evicted tiles");
    }
}

fn is_evictable(tile: &Tile) -> bool {
    !tile.is_loading() && !tile.is_awaited_by_parent()
}

/// Remove `tile` only when it is the tile cached under its key.
fn remove_exact(cache: &mut FifoCache<TileKey, Arc<Tile>>, tile: &Arc<Tile>) -> Option<Arc<Tile>> {
    let cached = cache.get(tile.key())?;
    if !Arc::ptr_eq(cached, tile) {
        return None;
    }
    cache.remove(tile.key())
}

/// Clear the parent/child links around a removed tile.
fn detach(tile: &Tile) {
    if let Some(children) = tile.children() {
        for child in children {
            child.clear_parent();
        }
    }
    tile.clear_parent();
}

/// Evict the family of a tile that was just removed from the cache.
fn evict_family(cache: &mut FifoCache<TileKey, Arc<Tile>>, tile: &Arc<Tile>) {
    if let Some(children) = tile.children() {
        for child in children {
            child.clear_parent();
            if !child.is_loading() {
                if let Some(removed) = remove_exact(cache, &child) {
                    evict_family(cache, &removed);
                }
            }
        }
    }

    if let Some(parent) = tile.parent() {
        if let Some(siblings) = parent.children() {
            for sibling in siblings {
                if Arc::ptr_eq(&sibling, tile) || !is_evictable(&sibling) {
                    continue;
                }
                if remove_exact(cache, &sibling).is_some() {
                    sibling.clear_parent();
                }
            }
        }
    }

    tile.clear_parent();
}

// =============================================================================
// Error Tile Cache
// =============================================================================

/// Bounded cache of tile keys whose loading failed permanently.
///
/// The viewport consults this cache so a failing tile is not requested again
/// on every repaint. Entries leave the cache through LRU eviction or an
/// explicit reset.
pub struct ErrorTileCache {
    cache: RwLock<LruCache<TileKey, String>>,
}

impl ErrorTileCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ERROR_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Remember a failed tile with its error message.
    pub async fn add(&self, key: TileKey, error: impl Into<String>) {
        let mut cache = self.cache.write().await;
        cache.put(key, error.into());
    }

    /// Get the error message for a failed tile.
    pub async fn get(&self, key: &TileKey) -> Option<String> {
        let mut cache = self.cache.write().await;
        cache.get(key).cloned()
    }

    /// Check for a failed tile without updating LRU order.
    pub async fn contains(&self, key: &TileKey) -> bool {
        let cache = self.cache.read().await;
        cache.contains(key)
    }

    pub async fn remove(&self, key: &TileKey) -> Option<String> {
        let mut cache = self.cache.write().await;
        cache.pop(key)
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

impl Default for ErrorTileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
