use image::{Rgba, RgbaImage};
use strata_shared::TerrainEncoding;

use crate::config::DownsampleMethod;

/// Largest output edge the downsampler will produce.
const MAX_TARGET_SIZE: u32 = 1024;

/// Elevation-aware 2:1 reduction. Each output pixel reads the 2x2 source
/// block at `(2*out_x, 2*out_y)`; `average` and `maximum` go through the
/// elevation domain, `nearest` copies the top-left pixel verbatim.
fn halve(img: &RgbaImage, encoding: TerrainEncoding, method: DownsampleMethod) -> RgbaImage {
    let (w, h) = img.dimensions();
    let (out_w, out_h) = (w / 2, h / 2);
    let mut out = RgbaImage::new(out_w, out_h);
    for out_y in 0..out_h {
        for out_x in 0..out_w {
            let block = [
                img.get_pixel(out_x * 2, out_y * 2),
                img.get_pixel(out_x * 2 + 1, out_y * 2),
                img.get_pixel(out_x * 2, out_y * 2 + 1),
                img.get_pixel(out_x * 2 + 1, out_y * 2 + 1),
            ];
            let pixel = match method {
                DownsampleMethod::Nearest => *block[0],
                DownsampleMethod::Average => {
                    let sum: f64 = block
                        .iter()
                        .map(|p| encoding.decode(p.0[0], p.0[1], p.0[2]))
                        .sum();
                    let (r, g, b) = encoding.encode(sum / 4.0);
                    Rgba([r, g, b, 255])
                }
                DownsampleMethod::Maximum => {
                    let max = block
                        .iter()
                        .map(|p| encoding.decode(p.0[0], p.0[1], p.0[2]))
                        .fold(f64::NEG_INFINITY, f64::max);
                    let (r, g, b) = encoding.encode(max);
                    Rgba([r, g, b, 255])
                }
            };
            out.put_pixel(out_x, out_y, pixel);
        }
    }
    out
}

/// Reduce a terrain tile to `target_size`. Returns `None` when the target is
/// not a power of two, exceeds the size cap, does not divide the source
/// width, or is not actually smaller; callers pass the input through
/// unchanged in that case.
pub fn downsample(
    img: &RgbaImage,
    encoding: TerrainEncoding,
    method: DownsampleMethod,
    target_size: u32,
) -> Option<RgbaImage> {
    let (w, h) = img.dimensions();
    if target_size == 0
        || !target_size.is_power_of_two()
        || target_size > MAX_TARGET_SIZE
        || w == 0
        || w != h
        || w % target_size != 0
        || target_size >= w
    {
        return None;
    }
    let mut current = halve(img, encoding, method);
    while current.width() > target_size {
        current = halve(&current, encoding, method);
    }
    Some(current)
}
