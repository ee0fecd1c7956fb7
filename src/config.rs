//! Configuration for the tile pipeline and its command-line tool.
//!
//! This module provides:
//! - [`LoaderConfig`]: library configuration of caches and workers
//! - [`Cli`]: command-line arguments via clap, for the `fetch` and `check`
//!   subcommands
//! - Environment variables with the `TILES_` prefix for every option
//!
//! # Example
//!
//! ```
//! use map_tile_pipeline::config::LoaderConfig;
//!
//! let config = LoaderConfig::new("/tmp/tiles").with_workers(8);
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Environment Variables
//!
//! - `TILES_URL` - URL template with `{z}`, `{x}`, `{y}` (fetch)
//! - `TILES_PROVIDER` - Provider id (default: osm)
//! - `TILES_CACHE_ROOT` - Offline cache directory (default: tile-cache)
//! - `TILES_WORKERS` - Concurrent tile loads (default: 4)
//! - `TILES_CACHE_TILES` - Tiles kept in memory (default: 2000)
//! - `TILES_CACHE_IMAGES` - Decoded images kept in memory (default: 500)
//! - `TILES_DIM_LEVEL` - Dim level, 255 = no dimming (default: 255)
//! - `TILES_DIM_COLOR` - Dim color as hex RGB (default: 000000)
//! - `TILES_NATIVE_MIN_ZOOM` - Compose lower zooms from this zoom (fetch)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::loader::{DEFAULT_EVENT_CAPACITY, DEFAULT_WORKER_COUNT};
use crate::raster::{DimSettings, DEFAULT_IMAGE_CACHE_CAPACITY, DEFAULT_OVERLAY_CACHE_CAPACITY};
use crate::tile::{
    TileKey, DEFAULT_ERROR_CACHE_CAPACITY, DEFAULT_EVICTION_SLACK, DEFAULT_TILE_CACHE_CAPACITY,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default offline cache directory.
pub const DEFAULT_CACHE_ROOT: &str = "tile-cache";

/// Default provider id.
pub const DEFAULT_PROVIDER_ID: &str = "osm";

/// Highest zoom level accepted on the command line.
pub const MAX_ZOOM: u8 = 24;

/// Most tiles a single command may touch.
pub const MAX_RANGE_TILES: u64 = 100_000;

/// Most concurrent workers.
pub const MAX_WORKERS: usize = 64;

// =============================================================================
// Loader Configuration
// =============================================================================

/// Configuration of a [`TileManager`](crate::TileManager).
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Root directory of the offline cache
    pub cache_root: PathBuf,

    /// Number of concurrent loader workers
    pub workers: usize,

    pub tile_cache_capacity: usize,
    pub image_cache_capacity: usize,
    pub overlay_cache_capacity: usize,
    pub error_cache_capacity: usize,

    /// Entries a cache may grow past its capacity before a batch eviction
    pub eviction_slack: usize,

    /// Events buffered per event listener
    pub event_capacity: usize,
}

impl LoaderConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_tile_cache_capacity(mut self, capacity: usize) -> Self {
        self.tile_cache_capacity = capacity;
        self
    }

    pub fn with_image_cache_capacity(mut self, capacity: usize) -> Self {
        self.image_cache_capacity = capacity;
        self
    }

    pub fn with_eviction_slack(mut self, slack: usize) -> Self {
        self.eviction_slack = slack;
        self
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_root.as_os_str().is_empty() {
            return Err("cache_root cannot be empty".to_string());
        }

        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(format!("workers must be between 1 and {}", MAX_WORKERS));
        }

        if self.tile_cache_capacity == 0 {
            return Err("tile_cache_capacity must be greater than 0".to_string());
        }
        if self.image_cache_capacity == 0 {
            return Err("image_cache_capacity must be greater than 0".to_string());
        }
        if self.overlay_cache_capacity == 0 {
            return Err("overlay_cache_capacity must be greater than 0".to_string());
        }
        if self.error_cache_capacity == 0 {
            return Err("error_cache_capacity must be greater than 0".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            workers: DEFAULT_WORKER_COUNT,
            tile_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            image_cache_capacity: DEFAULT_IMAGE_CACHE_CAPACITY,
            overlay_cache_capacity: DEFAULT_OVERLAY_CACHE_CAPACITY,
            error_cache_capacity: DEFAULT_ERROR_CACHE_CAPACITY,
            eviction_slack: DEFAULT_EVICTION_SLACK,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Map tile pipeline - prefetch and inspect an offline tile cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "map-tile-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load a range of tiles into the offline cache.
    Fetch(FetchConfig),

    /// Report which tiles of a range are in the offline cache.
    Check(CheckConfig),
}

/// A rectangular range of tiles at one zoom level.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TileRange {
    /// Zoom level.
    #[arg(short, long, env = "TILES_ZOOM")]
    pub zoom: u8,

    /// First column.
    #[arg(long, default_value_t = 0)]
    pub x_min: u32,

    /// Last column (default: x-min).
    #[arg(long)]
    pub x_max: Option<u32>,

    /// First row.
    #[arg(long, default_value_t = 0)]
    pub y_min: u32,

    /// Last row (default: y-min).
    #[arg(long)]
    pub y_max: Option<u32>,
}

impl TileRange {
    pub fn x_max(&self) -> u32 {
        self.x_max.unwrap_or(self.x_min)
    }

    pub fn y_max(&self) -> u32 {
        self.y_max.unwrap_or(self.y_min)
    }

    /// Number of tiles in the range.
    pub fn tile_count(&self) -> u64 {
        let columns = u64::from(self.x_max().saturating_sub(self.x_min)) + 1;
        let rows = u64::from(self.y_max().saturating_sub(self.y_min)) + 1;
        columns * rows
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.zoom > MAX_ZOOM {
            return Err(format!("zoom must be at most {}", MAX_ZOOM));
        }

        let n = 1u64 << self.zoom;
        if self.x_max() < self.x_min || self.y_max() < self.y_min {
            return Err("range maximum must not be below its minimum".to_string());
        }
        if u64::from(self.x_max()) >= n || u64::from(self.y_max()) >= n {
            return Err(format!(
                "tile range exceeds the {}x{} tiles of zoom {}",
                n, n, self.zoom
            ));
        }
        if self.tile_count() > MAX_RANGE_TILES {
            return Err(format!(
                "range covers {} tiles, at most {} allowed",
                self.tile_count(),
                MAX_RANGE_TILES
            ));
        }

        Ok(())
    }

    /// Keys of all tiles in the range, row by row.
    pub fn keys(&self, provider_id: &str) -> Vec<TileKey> {
        let mut keys = Vec::new();
        for y in self.y_min..=self.y_max() {
            for x in self.x_min..=self.x_max() {
                keys.push(TileKey::new(provider_id, self.zoom, x, y));
            }
        }
        keys
    }
}

/// Arguments of the `fetch` command.
#[derive(Args, Debug, Clone)]
pub struct FetchConfig {
    /// URL template, e.g. https://tile.openstreetmap.org/{z}/{x}/{y}.png
    #[arg(long, env = "TILES_URL")]
    pub url: String,

    /// Provider id, also the directory under the cache root.
    #[arg(long, default_value = DEFAULT_PROVIDER_ID, env = "TILES_PROVIDER")]
    pub provider: String,

    #[command(flatten)]
    pub range: TileRange,

    /// Number of concurrent tile loads.
    #[arg(short, long, default_value_t = DEFAULT_WORKER_COUNT, env = "TILES_WORKERS")]
    pub workers: usize,

    /// Root directory of the offline cache.
    #[arg(long, default_value = DEFAULT_CACHE_ROOT, env = "TILES_CACHE_ROOT")]
    pub cache_root: PathBuf,

    /// Maximum number of tiles kept in memory.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "TILES_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Maximum number of decoded images kept in memory.
    #[arg(long, default_value_t = DEFAULT_IMAGE_CACHE_CAPACITY, env = "TILES_CACHE_IMAGES")]
    pub cache_images: usize,

    /// Dim level: 255 shows tiles unchanged, 0 only the dim color.
    #[arg(long, default_value_t = 255, env = "TILES_DIM_LEVEL")]
    pub dim_level: u8,

    /// Dim color as hex RGB.
    #[arg(long, default_value = "000000", env = "TILES_DIM_COLOR")]
    pub dim_color: String,

    /// Lowest zoom the server has tiles for; lower zooms are composed from it.
    #[arg(long, env = "TILES_NATIVE_MIN_ZOOM")]
    pub native_min_zoom: Option<u8>,

    /// Print a JSON summary instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl FetchConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL template is required. Set --url or TILES_URL".to_string());
        }
        if self.provider.is_empty() {
            return Err("provider id cannot be empty".to_string());
        }

        self.range.validate()?;
        parse_color(&self.dim_color)?;

        if let Some(native) = self.native_min_zoom {
            if native > MAX_ZOOM {
                return Err(format!("native_min_zoom must be at most {}", MAX_ZOOM));
            }
            if native.saturating_sub(self.range.zoom) > 8 {
                return Err("native_min_zoom is more than 8 levels above zoom".to_string());
            }
        }

        self.loader_config().validate()
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig::new(&self.cache_root)
            .with_workers(self.workers)
            .with_tile_cache_capacity(self.cache_tiles)
            .with_image_cache_capacity(self.cache_images)
    }

    pub fn dim_settings(&self) -> Result<DimSettings, String> {
        Ok(DimSettings::new(self.dim_level, parse_color(&self.dim_color)?))
    }
}

/// Arguments of the `check` command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    /// Provider directory under the cache root.
    #[arg(long, default_value = DEFAULT_PROVIDER_ID, env = "TILES_PROVIDER")]
    pub provider: String,

    #[command(flatten)]
    pub range: TileRange,

    /// Root directory of the offline cache.
    #[arg(long, default_value = DEFAULT_CACHE_ROOT, env = "TILES_CACHE_ROOT")]
    pub cache_root: PathBuf,

    /// File extension of the offline files.
    #[arg(long, default_value = "png")]
    pub extension: String,

    /// Decode every file to detect corrupt tiles.
    #[arg(long, default_value_t = false)]
    pub decode: bool,

    /// Print a JSON summary instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.is_empty() {
            return Err("provider cannot be empty".to_string());
        }
        if self.extension.is_empty() || self.extension.contains(['/', '\\', '.']) {
            return Err(format!("invalid extension: {:?}", self.extension));
        }
        self.range.validate()
    }
}

/// Parse a hex RGB color such as `ff8800` or `#ff8800`.
pub fn parse_color(value: &str) -> Result<[u8; 3], String> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid color {:?}, expected hex RGB like 000000", value));
    }

    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("invalid color {:?}: {}", value, e))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

// =============================================================================
// Tests
// =============================================================================
