use image::{Rgba, RgbaImage};
use strata_shared::TerrainEncoding;

use crate::codec::{CodecError, raster};

/// LERC2 file identifier and the header layout this module understands.
const MAGIC: &[u8; 6] = b"Lerc2 ";
// key + 9 little-endian i32 fields + 3 f64 fields.
const HEADER_LEN: usize = 6 + 4 * 9 + 8 * 3;
const DT_FLOAT: i32 = 6;

/// Single-band elevation raster decoded from a LERC blob.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

/// A successfully parsed blob: either elevation data or the upstream's
/// "nothing here" marker (zero valid pixels).
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Empty,
    Grid(ElevationGrid),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LercError {
    #[error("not a LERC2 blob")]
    BadMagic,
    #[error("truncated LERC blob")]
    Truncated,
    #[error("LERC data type {0} is not single-band float")]
    NotFloat(i32),
    #[error("unsupported LERC encoding: {0}")]
    Unsupported(&'static str),
}

/// Decoder seam. The wire format is produced by an external native codec;
/// anything the in-tree baseline cannot read surfaces as `Unsupported` and
/// is recorded as a decode miss by the engine.
pub trait LercDecoder: Send + Sync {
    fn decode(&self, blob: &[u8]) -> Result<Decoded, LercError>;
}

/// Pure-Rust reader for the LERC2 v4 header plus the two storage layouts
/// that need no block decoding: a constant fill (`zMin == zMax`) and a raw
/// little-endian float plane.
#[derive(Debug, Default)]
pub struct BaselineDecoder;

impl LercDecoder for BaselineDecoder {
    fn decode(&self, blob: &[u8]) -> Result<Decoded, LercError> {
        let header = Header::parse(blob)?;
        if header.num_valid == 0 {
            return Ok(Decoded::Empty);
        }
        if header.data_type != DT_FLOAT {
            return Err(LercError::NotFloat(header.data_type));
        }
        let pixels = header.width as usize * header.height as usize;
        if header.num_valid != pixels as i32 {
            return Err(LercError::Unsupported("partial validity mask"));
        }

        if header.z_min == header.z_max {
            return Ok(Decoded::Grid(ElevationGrid {
                width: header.width as u32,
                height: header.height as u32,
                values: vec![header.z_min as f32; pixels],
            }));
        }

        let body = &blob[HEADER_LEN..];
        if body.len() < pixels * 4 {
            return Err(LercError::Unsupported("block-encoded payload"));
        }
        let values = body[..pixels * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Decoded::Grid(ElevationGrid {
            width: header.width as u32,
            height: header.height as u32,
            values,
        }))
    }
}

struct Header {
    width: i32,
    height: i32,
    num_valid: i32,
    data_type: i32,
    z_min: f64,
    z_max: f64,
}

impl Header {
    fn parse(blob: &[u8]) -> Result<Self, LercError> {
        if blob.len() < 6 || &blob[..6] != MAGIC {
            return Err(LercError::BadMagic);
        }
        if blob.len() < HEADER_LEN {
            return Err(LercError::Truncated);
        }
        let int_at = |offset: usize| {
            i32::from_le_bytes([
                blob[offset],
                blob[offset + 1],
                blob[offset + 2],
                blob[offset + 3],
            ])
        };
        let double_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&blob[offset..offset + 8]);
            f64::from_le_bytes(raw)
        };
        // key, version, checksum, nRows, nCols, nDepth, numValidPixel,
        // microBlockSize, blobSize, dataType, maxZError, zMin, zMax.
        Ok(Self {
            height: int_at(6 + 8),
            width: int_at(6 + 12),
            num_valid: int_at(6 + 20),
            data_type: int_at(6 + 32),
            z_min: double_at(6 + 44),
            z_max: double_at(6 + 52),
        })
    }
}

/// Render a decoded elevation grid as a Terrain-RGB PNG. A 257x257 grid
/// (ArcGIS overlap pixel) is cropped to its top-left 256x256.
pub fn terrain_rgb_png(grid: &ElevationGrid) -> Result<Vec<u8>, CodecError> {
    let (mut width, mut height) = (grid.width, grid.height);
    if width == 257 && height == 257 {
        width = 256;
        height = 256;
    }
    let mut img = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let value = grid.values[(y * grid.width + x) as usize];
            let (r, g, b) = TerrainEncoding::Mapbox.encode(value as f64);
            img.put_pixel(x, y, Rgba([r, g, b, 255]));
        }
    }
    raster::encode_png(&img)
}

/// Serialize a grid in the baseline layout. Tests for the engine and the
/// scanner build their fake upstreams with this.
#[cfg(test)]
pub(crate) fn encode_test_blob(
    width: i32,
    height: i32,
    num_valid: i32,
    data_type: i32,
    values: &[f32],
) -> Vec<u8> {
    let (z_min, z_max) = values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), v| {
        (lo.min(*v as f64), hi.max(*v as f64))
    });
    let constant = values.is_empty() || z_min == z_max;
    let mut blob = Vec::new();
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&4i32.to_le_bytes()); // version
    blob.extend_from_slice(&0i32.to_le_bytes()); // checksum
    blob.extend_from_slice(&height.to_le_bytes());
    blob.extend_from_slice(&width.to_le_bytes());
    blob.extend_from_slice(&1i32.to_le_bytes()); // nDepth
    blob.extend_from_slice(&num_valid.to_le_bytes());
    blob.extend_from_slice(&8i32.to_le_bytes()); // microBlockSize
    blob.extend_from_slice(&0i32.to_le_bytes()); // blobSize
    blob.extend_from_slice(&data_type.to_le_bytes());
    blob.extend_from_slice(&0f64.to_le_bytes()); // maxZError
    blob.extend_from_slice(&if constant { 0.0 } else { z_min }.to_le_bytes());
    blob.extend_from_slice(&if constant { 0.0 } else { z_max }.to_le_bytes());
    if constant && !values.is_empty() {
        // Constant fill is carried in the header; rewrite zMin/zMax.
        let start = blob.len() - 16;
        blob[start..start + 8].copy_from_slice(&(values[0] as f64).to_le_bytes());
        blob[start + 8..].copy_from_slice(&(values[0] as f64).to_le_bytes());
    } else {
        for value in values {
            blob.extend_from_slice(&value.to_le_bytes());
        }
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_blob_decodes_to_a_uniform_grid() {
        let blob = encode_test_blob(4, 4, 16, DT_FLOAT, &[123.4; 16]);
        let decoded = BaselineDecoder.decode(&blob).expect("decode");
        match decoded {
            Decoded::Grid(grid) => {
                assert_eq!(grid.width, 4);
                assert_eq!(grid.height, 4);
                assert!(grid.values.iter().all(|v| (*v - 123.4).abs() < 1e-3));
            }
            Decoded::Empty => panic!("expected a grid"),
        }
    }

    #[test]
    fn raw_plane_blob_decodes_values() {
        let values: Vec<f32> = (0..16).map(|i| i as f32 * 10.0).collect();
        let blob = encode_test_blob(4, 4, 16, DT_FLOAT, &values);
        let decoded = BaselineDecoder.decode(&blob).expect("decode");
        match decoded {
            Decoded::Grid(grid) => assert_eq!(grid.values, values),
            Decoded::Empty => panic!("expected a grid"),
        }
    }

    #[test]
    fn zero_valid_pixels_is_the_empty_sentinel_not_an_error() {
        let blob = encode_test_blob(4, 4, 0, DT_FLOAT, &[]);
        assert_eq!(BaselineDecoder.decode(&blob), Ok(Decoded::Empty));
    }

    #[test]
    fn non_float_types_are_rejected() {
        let blob = encode_test_blob(4, 4, 16, 2, &[1.0; 16]);
        assert_eq!(BaselineDecoder.decode(&blob), Err(LercError::NotFloat(2)));
    }

    #[test]
    fn garbage_and_truncation_are_distinct_errors() {
        assert_eq!(
            BaselineDecoder.decode(b"PNG not lerc"),
            Err(LercError::BadMagic)
        );
        let mut blob = encode_test_blob(4, 4, 16, DT_FLOAT, &[5.0; 16]);
        blob.truncate(20);
        assert_eq!(BaselineDecoder.decode(&blob), Err(LercError::Truncated));
    }

    #[test]
    fn partial_mask_is_unsupported() {
        let blob = encode_test_blob(4, 4, 7, DT_FLOAT, &[1.0, 2.0, 3.0]);
        assert!(matches!(
            BaselineDecoder.decode(&blob),
            Err(LercError::Unsupported(_))
        ));
    }

    #[test]
    fn terrain_rgb_png_round_trips_elevation() {
        let grid = ElevationGrid {
            width: 4,
            height: 4,
            values: vec![123.4; 16],
        };
        let png = terrain_rgb_png(&grid).expect("encode");
        let img = raster::decode(&png).expect("decode png");
        let p = img.get_pixel(1, 1);
        let decoded = TerrainEncoding::Mapbox.decode(p.0[0], p.0[1], p.0[2]);
        assert!((decoded - 123.4).abs() <= 0.05, "decoded {decoded}");
    }

    #[test]
    fn overlap_grids_crop_to_256() {
        let grid = ElevationGrid {
            width: 257,
            height: 257,
            values: vec![42.0; 257 * 257],
        };
        let png = terrain_rgb_png(&grid).expect("encode");
        let img = raster::decode(&png).expect("decode png");
        assert_eq!(img.dimensions(), (256, 256));
    }
}
