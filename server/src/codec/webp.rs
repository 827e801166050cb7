use image::RgbaImage;
use webp::{Encoder, WebPConfig};

use crate::codec::CodecError;

/// Encode RGBA pixels as WebP. `effort` follows the 0-9 config scale and is
/// clamped to libwebp's 0-6 method range.
pub fn encode(
    img: &RgbaImage,
    lossless: bool,
    quality: f32,
    effort: u8,
) -> Result<Vec<u8>, CodecError> {
    let mut config = WebPConfig::new()
        .map_err(|_| CodecError::WebpEncode("failed to initialize encoder config".into()))?;
    config.lossless = i32::from(lossless);
    config.quality = quality.clamp(0.0, 100.0);
    config.method = i32::from(effort.min(6));

    let encoder = Encoder::from_rgba(img.as_raw(), img.width(), img.height());
    let memory = encoder
        .encode_advanced(&config)
        .map_err(|e| CodecError::WebpEncode(format!("{e:?}")))?;
    Ok(memory.to_vec())
}

pub fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}
