use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::codec::CodecError;
use crate::config::RasterMethod;

/// Decode PNG/JPEG/WebP bytes into RGBA.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, CodecError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| CodecError::ImageDecode(e.to_string()))
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| CodecError::ImageEncode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Configured kernel names map onto the closest `image` crate filter;
/// `mitchell` and `lanczos2` land on their nearest neighbours.
pub fn filter_type(method: RasterMethod) -> FilterType {
    match method {
        RasterMethod::Nearest => FilterType::Nearest,
        RasterMethod::Linear => FilterType::Triangle,
        RasterMethod::Cubic | RasterMethod::Mitchell => FilterType::CatmullRom,
        RasterMethod::Lanczos2 | RasterMethod::Lanczos3 => FilterType::Lanczos3,
    }
}

pub fn resize(img: &RgbaImage, width: u32, height: u32, method: RasterMethod) -> RgbaImage {
    image::imageops::resize(img, width, height, filter_type(method))
}

/// Place four same-sized children on a `2W x 2H` canvas in image order
/// `[TL, TR, BL, BR]`. Missing children stay fully transparent. Returns
/// `NoData` when all four are absent.
pub fn combine(children: &[Option<RgbaImage>; 4]) -> Result<RgbaImage, CodecError> {
    let (w, h) = children
        .iter()
        .flatten()
        .next()
        .map(|img| img.dimensions())
        .ok_or(CodecError::NoData)?;

    let mut canvas = RgbaImage::from_pixel(w * 2, h * 2, Rgba([0, 0, 0, 0]));
    let offsets = [(0, 0), (w, 0), (0, h), (w, h)];
    for (child, (dx, dy)) in children.iter().zip(offsets) {
        if let Some(img) = child {
            if img.dimensions() != (w, h) {
                continue;
            }
            image::imageops::replace(&mut canvas, img, dx as i64, dy as i64);
        }
    }
    Ok(canvas)
}

/// Pre-baked tile returned to clients in debug mode: translucent field with
/// an opaque red diagonal cross.
pub fn error_tile(size: u32) -> Result<Vec<u8>, CodecError> {
    let size = size.max(1);
    let mut img = RgbaImage::from_pixel(size, size, Rgba([40, 40, 40, 96]));
    let red = Rgba([220, 30, 30, 255]);
    for i in 0..size {
        for thickness in 0..3u32 {
            let j = i.saturating_add(thickness).min(size - 1);
            img.put_pixel(i, j, red);
            img.put_pixel(i, size - 1 - j, red);
        }
    }
    encode_png(&img)
}
