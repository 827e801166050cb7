use serde::{Deserialize, Serialize};

/// Elevation-in-RGB encodings used by terrain tile providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerrainEncoding {
    Mapbox,
    Terrarium,
}

impl TerrainEncoding {
    pub fn from_metadata(value: &str) -> Option<Self> {
        match value {
            "mapbox" => Some(Self::Mapbox),
            "terrarium" => Some(Self::Terrarium),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mapbox => "mapbox",
            Self::Terrarium => "terrarium",
        }
    }

    /// Elevation in meters for one pixel.
    pub fn decode(&self, r: u8, g: u8, b: u8) -> f64 {
        match self {
            Self::Mapbox => {
                -10000.0 + (r as f64 * 65536.0 + g as f64 * 256.0 + b as f64) * 0.1
            }
            Self::Terrarium => r as f64 * 256.0 + g as f64 + b as f64 / 256.0 - 32768.0,
        }
    }

    /// RGB triple for an elevation in meters, clamped to the encodable range.
    pub fn encode(&self, elevation: f64) -> (u8, u8, u8) {
        let code = match self {
            Self::Mapbox => ((elevation + 10000.0) / 0.1).round(),
            Self::Terrarium => ((elevation + 32768.0) * 256.0).round(),
        }
        .clamp(0.0, (1 << 24) as f64 - 1.0) as u32;
        (
            (code >> 16) as u8,
            ((code >> 8) & 0xFF) as u8,
            (code & 0xFF) as u8,
        )
    }
}
