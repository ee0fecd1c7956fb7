//! Providers whose tiles are composed from the tiles of other providers.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use image::ImageFormat;

use crate::error::SourceError;
use crate::raster::DimSettings;
use crate::tile::{ChildSlot, TileKey};

use super::{ChildSpec, MapProvider, TilePainter};

// =============================================================================
// Downsample Provider
// =============================================================================

/// Serves zoom levels below the inner provider's native minimum by composing
/// each tile from the four tiles one level down.
///
/// ```text
///  zoom z          zoom z+1
/// ┌───────┐      ┌───┬───┐
/// │       │  ◀── │ 0 │ 1 │
/// │       │      ├───┼───┤
/// └───────┘      │ 2 │ 3 │
///                └───┴───┘
/// ```
///
/// Children at the native minimum are loaded from the inner provider;
/// children still below it are composed again by this provider.
pub struct DownsampleProvider {
    id: String,
    inner: Arc<dyn MapProvider>,
    native_min_zoom: u8,
    this: Weak<DownsampleProvider>,
}

impl DownsampleProvider {
    pub fn new(
        id: impl Into<String>,
        inner: Arc<dyn MapProvider>,
        native_min_zoom: u8,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            id,
            inner,
            native_min_zoom,
            this: this.clone(),
        })
    }

    pub fn native_min_zoom(&self) -> u8 {
        self.native_min_zoom
    }

    pub fn inner(&self) -> &Arc<dyn MapProvider> {
        &self.inner
    }

    fn child_provider(&self, child_zoom: u8) -> Option<Arc<dyn MapProvider>> {
        if child_zoom >= self.native_min_zoom {
            return Some(self.inner.clone());
        }
        let this = self.this.upgrade()?;
        Some(this as Arc<dyn MapProvider>)
    }
}

#[async_trait]
impl MapProvider for DownsampleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        self.inner.tile_size()
    }

    fn image_format(&self) -> ImageFormat {
        self.inner.image_format()
    }

    fn allows_offline(&self) -> bool {
        self.inner.allows_offline()
    }

    fn dim(&self) -> DimSettings {
        self.inner.dim()
    }

    fn max_zoom(&self) -> u8 {
        self.inner.max_zoom()
    }

    fn tile_children(&self, key: &TileKey) -> Option<Vec<ChildSpec>> {
        if key.zoom >= self.native_min_zoom {
            return None;
        }

        let child_zoom = key.zoom + 1;
        let provider = self.child_provider(child_zoom)?;
        let half = self.tile_size() / 2;

        let children = (0..4u32)
            .map(|i| {
                let (dx, dy) = (i % 2, i / 2);
                let mut child_key =
                    TileKey::new(provider.id(), child_zoom, key.x * 2 + dx, key.y * 2 + dy);
                child_key.custom = key.custom.clone();

                ChildSpec {
                    key: child_key,
                    provider: provider.clone(),
                    slot: ChildSlot {
                        x: dx * half,
                        y: dy * half,
                        width: half,
                        height: half,
                    },
                }
            })
            .collect();

        Some(children)
    }

    fn painter(&self) -> Option<&dyn TilePainter> {
        self.inner.painter()
    }

    fn tile_url(&self, key: &TileKey) -> Option<String> {
        self.inner.tile_url(key)
    }

    async fn fetch(&self, key: &TileKey) -> Result<Bytes, SourceError> {
        self.inner.fetch(key).await
    }
}

// =============================================================================
// Layered Provider
// =============================================================================

/// Stacks the tiles of several providers, first layer at the bottom.
///
/// Every layer keeps its own tiles and offline files; the stacked result is
/// stored under this provider's path.
pub struct LayeredProvider {
    id: String,
    layers: Vec<Arc<dyn MapProvider>>,
    tile_size: u32,
}

impl LayeredProvider {
    /// Create a layered provider. The tile size is taken from the first
    /// layer.
    pub fn new(id: impl Into<String>, layers: Vec<Arc<dyn MapProvider>>) -> Result<Self, String> {
        let first = layers
            .first()
            .ok_or_else(|| "A layered provider needs at least one layer".to_string())?;
        let tile_size = first.tile_size();

        Ok(Self {
            id: id.into(),
            layers,
            tile_size,
        })
    }

    pub fn layers(&self) -> &[Arc<dyn MapProvider>] {
        &self.layers
    }
}

#[async_trait]
impl MapProvider for LayeredProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn min_zoom(&self) -> u8 {
        self.layers.iter().map(|l| l.min_zoom()).max().unwrap_or(0)
    }

    fn max_zoom(&self) -> u8 {
        self.layers.iter().map(|l| l.max_zoom()).min().unwrap_or(0)
    }

    fn tile_children(&self, key: &TileKey) -> Option<Vec<ChildSpec>> {
        let children = self
            .layers
            .iter()
            .map(|layer| ChildSpec {
                key: key.for_provider(layer.id()),
                provider: layer.clone(),
                slot: ChildSlot::full(self.tile_size),
            })
            .collect();
        Some(children)
    }

    async fn fetch(&self, key: &TileKey) -> Result<Bytes, SourceError> {
        Err(SourceError::Stream(format!(
            "{} is composed from layers and has no byte stream",
            key
        )))
    }
}
