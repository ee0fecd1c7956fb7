//! Test utilities for integration tests.
//!
//! This module provides mock map providers that track their requests and
//! helpers for building managers and images.

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use map_tile_pipeline::error::{SourceError, TileError};
use map_tile_pipeline::loader::{TileEvent, TileEventKind};
use map_tile_pipeline::provider::{MapProvider, TilePainter};
use map_tile_pipeline::raster::DimSettings;
use map_tile_pipeline::tile::TileKey;
use map_tile_pipeline::{LoaderConfig, TileManager};

/// Edge length of mock tiles; small enough to keep composition cheap.
pub const TEST_TILE_SIZE: u32 = 8;

// =============================================================================
// Mock Provider with Request Tracking
// =============================================================================

/// How a [`MockProvider`] answers a fetch.
#[derive(Clone)]
enum Behavior {
    Solid([u8; 4]),
    Fail(SourceError),
    Garbage,
    Panic,
}

/// A map provider serving solid tiles and counting every fetch.
pub struct MockProvider {
    id: String,
    behavior: Behavior,
    tile_size: u32,
    delay: Option<Duration>,
    dim: DimSettings,
    allows_offline: bool,
    fetch_count: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            behavior: Behavior::Solid([90, 120, 150, 255]),
            tile_size: TEST_TILE_SIZE,
            delay: None,
            dim: DimSettings::none(),
            allows_offline: true,
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_color(mut self, color: [u8; 4]) -> Self {
        self.behavior = Behavior::Solid(color);
        self
    }

    pub fn failing(mut self, error: SourceError) -> Self {
        self.behavior = Behavior::Fail(error);
        self
    }

    /// Serve bytes that are not an image.
    pub fn garbage(mut self) -> Self {
        self.behavior = Behavior::Garbage;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dim(mut self, dim: DimSettings) -> Self {
        self.dim = dim;
        self
    }

    pub fn without_offline(mut self) -> Self {
        self.allows_offline = false;
        self
    }

    /// Shared handle on the fetch counter, valid after the provider is moved.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetch_count)
    }

    pub fn shared(self) -> Arc<dyn MapProvider> {
        Arc::new(self)
    }
}

#[async_trait]
impl MapProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn allows_offline(&self) -> bool {
        self.allows_offline
    }

    fn dim(&self) -> DimSettings {
        self.dim
    }

    async fn fetch(&self, key: &TileKey) -> Result<Bytes, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            Behavior::Solid(color) => Ok(solid_png(self.tile_size, *color)),
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Garbage => Ok(Bytes::from_static(b"definitely not an image")),
            Behavior::Panic => panic!("mock provider exploded on {}", key),
        }
    }
}

// =============================================================================
// Painting Provider
// =============================================================================

/// Paints a solid tile locally, or fails to paint.
pub struct SolidPainter {
    color: Option<[u8; 4]>,
}

impl TilePainter for SolidPainter {
    fn paint(&self, _key: &TileKey, tile_size: u32) -> Result<RgbaImage, TileError> {
        match self.color {
            Some(color) => Ok(RgbaImage::from_pixel(tile_size, tile_size, Rgba(color))),
            None => Err(TileError::Paint {
                message: "no elevation data".to_string(),
            }),
        }
    }
}

/// A provider whose tiles are painted instead of fetched.
pub struct PaintingProvider {
    id: String,
    painter: SolidPainter,
    fetch_count: Arc<AtomicUsize>,
}

impl PaintingProvider {
    pub fn new(id: &str, color: Option<[u8; 4]>) -> Self {
        Self {
            id: id.to_string(),
            painter: SolidPainter { color },
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetch_count)
    }
}

#[async_trait]
impl MapProvider for PaintingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        TEST_TILE_SIZE
    }

    fn painter(&self) -> Option<&dyn TilePainter> {
        Some(&self.painter)
    }

    async fn fetch(&self, _key: &TileKey) -> Result<Bytes, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Stream("painted tiles are never fetched".to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Encode a solid square PNG.
pub fn solid_png(size: u32, color: [u8; 4]) -> Bytes {
    let image = RgbaImage::from_pixel(size, size, Rgba(color));
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("PNG encoding should succeed");
    Bytes::from(buffer.into_inner())
}

/// Decode an image file from disk.
pub fn read_image(path: &Path) -> RgbaImage {
    image::open(path).expect("offline file should decode").to_rgba8()
}

/// A manager caching below `root`.
pub fn manager_at(root: &Path, workers: usize) -> TileManager {
    TileManager::new(LoaderConfig::new(root).with_workers(workers)).expect("manager should start")
}

/// Run a future, failing the test if it takes longer than five seconds.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

/// Poll a condition until it holds, failing after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Drain all events received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<TileEvent>) -> Vec<TileEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Count events of one kind for one tile.
pub fn count_events(events: &[TileEvent], kind: TileEventKind, key: &TileKey) -> usize {
    events
        .iter()
        .filter(|e| e.kind == kind && e.key.as_ref() == Some(key))
        .count()
}
