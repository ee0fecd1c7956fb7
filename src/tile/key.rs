//! Tile identity and the offline file layout.
//!
//! A tile is identified by the provider that renders it, its zoom level and
//! its column/row, optionally refined by a provider-specific custom part
//! (e.g. a layer name for providers that serve several variants of the same
//! tile).
//!
//! # Offline Layout
//!
//! ```text
//! <cache_root>/<provider_path>[/<custom>]/<zoom>/<x>/<y>.<ext>
//! <cache_root>/<provider_path>[/<custom>]/<zoom>/<x>/<y>-part.<ext>
//! ```
//!
//! The `-part` form holds a composed tile that was saved although not every
//! child tile could be loaded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name suffix for composed tiles saved with missing children.
pub const PART_SUFFIX: &str = "-part";

/// Identity of a map tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Id of the provider which renders this tile
    pub provider_id: Arc<str>,

    /// Zoom level (0 = whole world in one tile)
    pub zoom: u8,

    /// Column, 0-indexed from the left
    pub x: u32,

    /// Row, 0-indexed from the top
    pub y: u32,

    /// Provider-specific custom part of the identity
    pub custom: Option<Arc<str>>,
}

impl TileKey {
    /// Create a key without a custom part.
    pub fn new(provider_id: impl Into<Arc<str>>, zoom: u8, x: u32, y: u32) -> Self {
        Self {
            provider_id: provider_id.into(),
            zoom,
            x,
            y,
            custom: None,
        }
    }

    /// Return this key with a custom identity part.
    pub fn with_custom(mut self, custom: impl Into<Arc<str>>) -> Self {
        self.custom = Some(custom.into());
        self
    }

    /// Key of the same position served by another provider.
    pub fn for_provider(&self, provider_id: impl Into<Arc<str>>) -> Self {
        Self {
            provider_id: provider_id.into(),
            zoom: self.zoom,
            x: self.x,
            y: self.y,
            custom: self.custom.clone(),
        }
    }

    /// Number of tiles along one axis at this key's zoom level.
    pub fn tiles_per_axis(&self) -> u64 {
        1u64 << self.zoom.min(63)
    }

    /// Whether column and row lie inside the world at this zoom level.
    pub fn is_valid(&self) -> bool {
        let n = self.tiles_per_axis();
        u64::from(self.x) < n && u64::from(self.y) < n
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.provider_id, self.zoom, self.x, self.y)?;
        if let Some(custom) = &self.custom {
            write!(f, "-{}", custom)?;
        }
        Ok(())
    }
}

/// Compute the offline file path for a tile.
///
/// This is a pure function of its inputs; the file is not touched.
pub fn offline_path(
    cache_root: &Path,
    provider_path: &str,
    key: &TileKey,
    extension: &str,
    partial: bool,
) -> PathBuf {
    let mut path = cache_root.to_path_buf();

    for part in provider_path.split(['/', '\\']).filter(|p| !p.is_empty()) {
        path.push(part);
    }
    if let Some(custom) = &key.custom {
        path.push(custom.as_ref());
    }

    path.push(key.zoom.to_string());
    path.push(key.x.to_string());

    let suffix = if partial { PART_SUFFIX } else { "" };
    path.push(format!("{}{}.{}", key.y, suffix, extension));
    path
}
