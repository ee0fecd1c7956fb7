//! Decoded tile image cache with offline persistence.
//!
//! # Offline Cache
//!
//! Every provider that allows offline images gets a directory under the
//! cache root (see [`crate::tile::offline_path`]). Reads try the exact file
//! first and then the `-part` file. A file that exists but cannot be decoded
//! marks the tile with an offline read error, after which its offline files
//! are never read again.
//!
//! Writes go to a temporary file that is renamed into place, so a reader
//! never sees a half-written tile.
//!
//! # Locks
//!
//! - Directory-creation lock: the set of directories known to exist
//! - Eviction lock: the write half of the image map's lock
//!
//! The two are independent, so saving a tile never waits for an eviction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::ImageFormat;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::TileError;
use crate::fifo::FifoCache;
use crate::tile::{offline_path, Tile, TileKey, DEFAULT_EVICTION_SLACK};

use super::codec::{decode_first_frame, encode, extension_for};
use super::render::RenderExecutor;
use super::{SourceImage, TileImage};

/// Default number of decoded images kept in memory.
pub const DEFAULT_IMAGE_CACHE_CAPACITY: usize = 500;

/// An image read back from the offline cache.
#[derive(Debug, Clone)]
pub struct OfflineImage {
    pub source: SourceImage,

    /// The image came from a `-part` file
    pub partial: bool,

    pub path: PathBuf,
}

/// Bounded cache of display-ready tile images.
///
/// # Thread Safety
///
/// Shared by all loader workers via `Arc`; every method takes `&self`.
pub struct TileImageCache {
    cache_root: PathBuf,
    images: RwLock<FifoCache<TileKey, TileImage>>,
    created_dirs: Mutex<HashSet<PathBuf>>,
    render: Arc<RenderExecutor>,
    temp_counter: AtomicU64,
}

impl TileImageCache {
    /// Create an image cache with default capacity.
    pub fn new(cache_root: impl Into<PathBuf>, render: Arc<RenderExecutor>) -> Self {
        Self::with_capacity(
            cache_root,
            render,
            DEFAULT_IMAGE_CACHE_CAPACITY,
            DEFAULT_EVICTION_SLACK,
        )
    }

    pub fn with_capacity(
        cache_root: impl Into<PathBuf>,
        render: Arc<RenderExecutor>,
        capacity: usize,
        slack: usize,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            images: RwLock::new(FifoCache::new(capacity, slack)),
            created_dirs: Mutex::new(HashSet::new()),
            render,
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Offline file path of a tile, the `-part` variant when `partial`.
    pub fn offline_path(&self, tile: &Tile, partial: bool) -> PathBuf {
        let provider = tile.provider();
        offline_path(
            &self.cache_root,
            provider.offline_path(),
            tile.key(),
            extension_for(provider.image_format()),
            partial,
        )
    }

    // =========================================================================
    // Offline read
    // =========================================================================

    /// Read a tile's image from the offline cache.
    ///
    /// Returns `None` when the provider does not allow offline images, no
    /// file exists, or the file is corrupt. Corruption is recorded on the
    /// tile.
    pub async fn get_offline_image(&self, tile: &Tile) -> Option<OfflineImage> {
        if !tile.provider().allows_offline() || tile.is_offline_read_error() {
            return None;
        }

        for partial in [false, true] {
            let path = self.offline_path(tile, partial);

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(tile = %tile.key(), path = %path.display(), error = %e, "Failed to read offline image");
                    continue;
                }
            };

            return match decode_first_frame(&bytes) {
                Ok((image, format)) => {
                    tile.set_offline_path(path.clone());
                    tile.set_offline_image_available(true);
                    Some(OfflineImage {
                        source: SourceImage {
                            image,
                            encoded: Some(bytes),
                            format: Some(format),
                        },
                        partial,
                        path,
                    })
                }
                Err(e) => {
                    let error = TileError::OfflineCorrupt {
                        path,
                        message: e.to_string(),
                    };
                    warn!(tile = %tile.key(), error = %error, "Ignoring offline image");
                    tile.set_offline_read_error(true);
                    None
                }
            };
        }

        None
    }

    /// Refresh whether an offline file exists for a tile.
    ///
    /// Only checks existence; the file is not decoded.
    pub async fn set_offline_image_availability(&self, tile: &Tile) -> bool {
        if !tile.provider().allows_offline() {
            tile.set_offline_image_available(false);
            return false;
        }

        for partial in [false, true] {
            let path = self.offline_path(tile, partial);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tile.set_offline_path(path);
                tile.set_offline_image_available(true);
                return true;
            }
        }

        tile.set_offline_image_available(false);
        false
    }

    // =========================================================================
    // Offline write
    // =========================================================================

    /// Write a tile image to the offline cache.
    ///
    /// Encoded bytes of a recognised format are written as they are;
    /// everything else is encoded in the provider's format, or PNG when that
    /// fails.
    pub async fn save_offline_image(
        &self,
        tile: &Tile,
        source: &SourceImage,
        is_partial: bool,
    ) -> Result<PathBuf, TileError> {
        let path = self.offline_path(tile, is_partial);

        if let Some(dir) = path.parent() {
            self.ensure_dir(dir).await?;
        }

        let bytes = match (&source.encoded, source.format) {
            (Some(encoded), Some(_)) => encoded.clone(),
            _ => encode_for_provider(&source.image, tile.provider().image_format())?,
        };

        let temp = self.temp_path(&path);
        tokio::fs::write(&temp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tile.set_offline_path(path.clone());
        tile.set_offline_image_available(true);
        debug!(tile = %tile.key(), path = %path.display(), bytes = bytes.len(), "Saved offline image");

        Ok(path)
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<(), TileError> {
        let mut created = self.created_dirs.lock().await;
        if created.contains(dir) {
            return Ok(());
        }

        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            warn!(path = %dir.display(), error = %e, "Failed to create offline directory");
            TileError::from(e)
        })?;

        created.insert(dir.to_path_buf());
        Ok(())
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, n))
    }

    // =========================================================================
    // In-memory cache
    // =========================================================================

    /// Turn a source image into the tile's display image.
    ///
    /// Saves the source offline when asked to, dims it on the render thread,
    /// caches the result and sets it on the tile. An offline save failure is
    /// logged and does not fail the tile.
    pub async fn setup_image(
        &self,
        source: SourceImage,
        tile: &Tile,
        should_save: bool,
        is_partial: bool,
    ) -> Result<TileImage, TileError> {
        if should_save && tile.provider().allows_offline() {
            if let Err(e) = self.save_offline_image(tile, &source, is_partial).await {
                warn!(tile = %tile.key(), error = %e, "Failed to save offline image");
            }
        }

        let dim = tile.provider().dim();
        let pixels = self.render.dim(source.image, dim).await?;
        let image = TileImage::new(pixels, is_partial);

        if !tile.set_image(image.clone()) {
            // Keep the first image; the cache must agree with the tile
            if let Some(existing) = tile.image() {
                return Ok(existing);
            }
        }

        self.insert(tile.key().clone(), image.clone()).await;
        Ok(image)
    }

    /// The cached image of a tile.
    ///
    /// On a miss for a tile that is not loading, offline availability is
    /// refreshed so the caller can decide whether to request the tile.
    pub async fn get_tile_image(&self, tile: &Tile) -> Option<TileImage> {
        if let Some(image) = self.get(tile.key()).await {
            return Some(image);
        }

        if !tile.is_loading() {
            self.set_offline_image_availability(tile).await;
        }
        None
    }

    pub async fn get(&self, key: &TileKey) -> Option<TileImage> {
        self.images.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: TileKey, image: TileImage) {
        let mut images = self.images.write().await;
        let evicted = images.insert_and_evict(key, image);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), remaining = images.len(), "Evicted tile images");
        }
    }

    pub async fn contains(&self, key: &TileKey) -> bool {
        self.images.read().await.contains(key)
    }

    pub async fn remove(&self, key: &TileKey) -> Option<TileImage> {
        self.images.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.images.read().await.capacity()
    }

    /// Release every cached image and forget the created directories.
    pub async fn dispose(&self) {
        let released = self.images.write().await.drain().len();
        self.created_dirs.lock().await.clear();
        debug!(released, "Disposed tile image cache");
    }
}

fn encode_for_provider(image: &image::RgbaImage, format: ImageFormat) -> Result<Bytes, TileError> {
    match encode(image, format) {
        Ok(bytes) => Ok(bytes),
        Err(e) if format != ImageFormat::Png => {
            debug!(format = ?format, error = %e, "Falling back to PNG");
            encode(image, ImageFormat::Png)
        }
        Err(e) => Err(e),
    }
}
