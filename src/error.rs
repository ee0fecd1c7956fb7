use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a tile byte-stream source (network or custom loader).
///
/// The variants mirror the categories shown to the user as a tile's
/// loading error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The server answered but has no tile at this address
    #[error("Tile not found: {0}")]
    NotFound(String),

    /// The host name of the tile server could not be resolved or reached
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// Any other failure while opening or reading the stream
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Errors that can occur while loading a single tile.
///
/// Every variant is terminal for the tile it happened on: the loader records
/// the message as the tile's loading error and never retries on its own.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Error from the provider's byte stream
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Image bytes could not be decoded
    #[error("Failed to decode tile image: {message}")]
    Decode { message: String },

    /// Image could not be encoded for the offline cache
    #[error("Failed to encode tile image: {message}")]
    Encode { message: String },

    /// An offline file exists but is not a readable image
    #[error("Offline image is corrupt: {}: {message}", path.display())]
    OfflineCorrupt { path: PathBuf, message: String },

    /// File system error in the offline cache
    #[error("Offline cache I/O error: {0}")]
    Io(String),

    /// The provider's painter failed to produce pixels
    #[error("Painting failed: {message}")]
    Paint { message: String },

    /// No child tile of a composed parent could be loaded
    #[error("Composition failed: {message}")]
    Composition { message: String },

    /// The render thread is gone (pipeline disposed)
    #[error("Render executor is not available")]
    RenderUnavailable,

    /// A tile finished with a loading error earlier
    #[error("Tile {key} failed: {message}")]
    Failed { key: String, message: String },

    /// The loading task was aborted
    #[error("Tile loading was cancelled")]
    Cancelled,

    /// Anything else, e.g. a panic inside a loader task
    #[error("Unexpected error: {message}")]
    Unexpected { message: String },
}

impl From<std::io::Error> for TileError {
    fn from(err: std::io::Error) -> Self {
        TileError::Io(err.to_string())
    }
}

impl From<image::ImageError> for TileError {
    fn from(err: image::ImageError) -> Self {
        TileError::Decode {
            message: err.to_string(),
        }
    }
}
