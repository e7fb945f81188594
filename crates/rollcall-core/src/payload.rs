//! Image intake: turns uploaded payloads into canonical RGB bitmaps.
//!
//! Accepts either raw file bytes or a base64 string (optionally wrapped in a
//! `data:image/...;base64,` URL, as browsers submit camera captures).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("could not decode image: {0}")]
    Decode(image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(image::ImageError),
}

/// An image as submitted by a caller.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Base64 text, with or without a `data:` URL prefix.
    Encoded(String),
    /// Raw file contents (PNG, JPEG, ...).
    Binary(Vec<u8>),
}

impl ImagePayload {
    /// Base64 form of the payload, without any `data:` prefix.
    pub fn to_base64(&self) -> String {
        match self {
            ImagePayload::Encoded(text) => strip_data_url(text).to_string(),
            ImagePayload::Binary(bytes) => STANDARD.encode(bytes),
        }
    }

    /// Raw bytes of the payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        match self {
            ImagePayload::Encoded(text) => {
                let body = strip_data_url(text);
                if body.is_empty() {
                    return Err(ImageError::Empty);
                }
                // Browsers occasionally wrap long base64 bodies.
                let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                Ok(STANDARD.decode(compact)?)
            }
            ImagePayload::Binary(bytes) => Ok(bytes.clone()),
        }
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        ImagePayload::Binary(bytes)
    }
}

impl From<String> for ImagePayload {
    fn from(text: String) -> Self {
        ImagePayload::Encoded(text)
    }
}

/// Strip a `data:image/...;base64,` prefix and surrounding whitespace.
pub fn strip_data_url(text: &str) -> &str {
    let text = text.trim();
    if text.starts_with("data:") {
        match text.split_once(',') {
            Some((_, body)) => body.trim(),
            None => "",
        }
    } else {
        text
    }
}

/// Decode a payload into an 8-bit RGB bitmap.
pub fn decode(payload: &ImagePayload) -> Result<RgbImage, ImageError> {
    let bytes = payload.to_bytes()?;
    decode_bytes(&bytes)
}

/// Decode encoded image bytes into an 8-bit RGB bitmap.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    let decoded = image::load_from_memory(bytes).map_err(ImageError::Decode)?;
    Ok(decoded.to_rgb8())
}

/// Encode a bitmap into the canonical stored form (lossless PNG).
///
/// Lossless storage keeps re-decoded enrollment images pixel-identical to what
/// was embedded at enrollment time.
pub fn encode_canonical(image: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(ImageError::Encode)?;
    Ok(buffer.into_inner())
}
