//! Tile image decoding and encoding.
//!
//! Decoding always guesses the format from the content, so an offline file
//! is readable whatever extension it was stored under. Animated formats
//! yield their first frame.

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};

use crate::error::TileError;

/// Decode the first frame of an image, returning its pixels and format.
pub fn decode_first_frame(bytes: &[u8]) -> Result<(RgbaImage, ImageFormat), TileError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TileError::Decode {
            message: e.to_string(),
        })?;

    let format = reader.format().ok_or_else(|| TileError::Decode {
        message: "unrecognised image format".to_string(),
    })?;

    let image = reader.decode()?;
    Ok((image.into_rgba8(), format))
}

/// Encode pixels in the given format.
///
/// Formats without an alpha channel (JPEG) get the pixels flattened to RGB.
pub fn encode(image: &RgbaImage, format: ImageFormat) -> Result<Bytes, TileError> {
    let mut output = Cursor::new(Vec::new());

    let result = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgba8(image.clone())
            .to_rgb8()
            .write_to(&mut output, format),
        _ => image.write_to(&mut output, format),
    };

    result.map_err(|e| TileError::Encode {
        message: e.to_string(),
    })?;

    Ok(Bytes::from(output.into_inner()))
}

/// File extension used for offline files of a format.
pub fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("png")
}
