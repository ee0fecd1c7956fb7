//! Tile provider backed by an HTTP URL template.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::ImageFormat;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::error::SourceError;
use crate::raster::DimSettings;
use crate::tile::TileKey;

use super::{MapProvider, DEFAULT_MAX_ZOOM, DEFAULT_TILE_SIZE};

/// User agent sent with every tile request.
pub const DEFAULT_USER_AGENT: &str = concat!("map-tile-pipeline/", env!("CARGO_PKG_VERSION"));

/// Request timeout for a single tile.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches tiles from a URL template such as
/// `https://tile.openstreetmap.org/{z}/{x}/{y}.png`.
///
/// The persistence format is guessed from the template's file extension.
///
/// # Example
///
/// ```
/// use map_tile_pipeline::provider::HttpProvider;
/// use map_tile_pipeline::tile::TileKey;
///
/// let provider = HttpProvider::new("osm", "https://tile.example.org/{z}/{x}/{y}.png").unwrap();
/// let url = provider.url_for(&TileKey::new("osm", 5, 3, 7));
/// assert_eq!(url, "https://tile.example.org/5/3/7.png");
/// ```
#[derive(Debug, Clone)]
pub struct HttpProvider {
    id: String,
    template: String,
    client: reqwest::Client,
    offline_path: String,
    image_format: ImageFormat,
    allows_offline: bool,
    dim: DimSettings,
    tile_size: u32,
    min_zoom: u8,
    max_zoom: u8,
}

impl HttpProvider {
    /// Create a provider for a URL template.
    ///
    /// The template must contain `{z}`, `{x}` and `{y}` and expand to an
    /// absolute http(s) URL.
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        let template = template.into();

        if id.is_empty() {
            return Err("Provider id cannot be empty".to_string());
        }
        let url = validate_template(&template)?;

        let image_format = ImageFormat::from_path(url.path()).unwrap_or(ImageFormat::Png);

        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            offline_path: id.clone(),
            id,
            template,
            client,
            image_format,
            allows_offline: true,
            dim: DimSettings::none(),
            tile_size: DEFAULT_TILE_SIZE,
            min_zoom: 0,
            max_zoom: DEFAULT_MAX_ZOOM,
        })
    }

    /// Use a preconfigured client, e.g. with proxy settings.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_offline_path(mut self, path: impl Into<String>) -> Self {
        self.offline_path = path.into();
        self
    }

    pub fn with_image_format(mut self, format: ImageFormat) -> Self {
        self.image_format = format;
        self
    }

    pub fn with_dim(mut self, dim: DimSettings) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn without_offline(mut self) -> Self {
        self.allows_offline = false;
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Expand the template for a tile.
    pub fn url_for(&self, key: &TileKey) -> String {
        expand(&self.template, key.zoom, key.x, key.y)
    }
}

#[async_trait]
impl MapProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn offline_path(&self) -> &str {
        &self.offline_path
    }

    fn image_format(&self) -> ImageFormat {
        self.image_format
    }

    fn allows_offline(&self) -> bool {
        self.allows_offline
    }

    fn dim(&self) -> DimSettings {
        self.dim
    }

    fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn tile_url(&self, key: &TileKey) -> Option<String> {
        Some(self.url_for(key))
    }

    async fn fetch(&self, key: &TileKey) -> Result<Bytes, SourceError> {
        let url = self.url_for(key);
        debug!(tile = %key, url = %url, "Fetching tile");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| categorize(&url, &e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url));
        }
        if !status.is_success() {
            return Err(SourceError::Stream(format!("HTTP {} from {}", status, url)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Stream(format!("Failed to read {}: {}", url, e)))?;

        if bytes.is_empty() {
            return Err(SourceError::Stream(format!("Empty response from {}", url)));
        }

        Ok(bytes)
    }
}

fn expand(template: &str, zoom: u8, x: u32, y: u32) -> String {
    template
        .replace("{z}", &zoom.to_string())
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
}

fn validate_template(template: &str) -> Result<Url, String> {
    for placeholder in ["{z}", "{x}", "{y}"] {
        if !template.contains(placeholder) {
            return Err(format!("URL template is missing {}: {}", placeholder, template));
        }
    }

    let url = Url::parse(&expand(template, 0, 0, 0))
        .map_err(|e| format!("Invalid URL template {}: {}", template, e))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("Unsupported URL scheme: {}", scheme)),
    }
    if url.host_str().is_none() {
        return Err(format!("URL template has no host: {}", template));
    }

    Ok(url)
}

/// Map a request failure to the category shown as the tile's error.
fn categorize(url: &str, err: &reqwest::Error) -> SourceError {
    if err.is_connect() {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        SourceError::UnknownHost(host)
    } else if err.is_timeout() {
        SourceError::Stream(format!("Timed out fetching {}", url))
    } else {
        SourceError::Stream(format!("Request to {} failed: {}", url, err))
    }
}
