use serde::{Deserialize, Serialize};

/// Geographic bounding box, degrees, MBTiles metadata order `W,S,E,N`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLatBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl LngLatBounds {
    pub const WORLD: LngLatBounds = LngLatBounds {
        west: -180.0,
        south: -85.0511,
        east: 180.0,
        north: 85.0511,
    };

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(',').map(|part| part.trim().parse::<f64>());
        let west = parts.next()?.ok()?;
        let south = parts.next()?.ok()?;
        let east = parts.next()?.ok()?;
        let north = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        let bounds = Self {
            west,
            south,
            east,
            north,
        };
        bounds.is_valid().then_some(bounds)
    }

    pub fn is_valid(&self) -> bool {
        self.west < self.east
            && self.south < self.north
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east)
            && (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
    }

    pub fn to_metadata(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

/// Map center, MBTiles metadata order `lon,lat,zoom`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub lng: f64,
    pub lat: f64,
    pub zoom: u8,
}

impl Center {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(',').map(str::trim);
        let lng = parts.next()?.parse().ok()?;
        let lat = parts.next()?.parse().ok()?;
        let zoom = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { lng, lat, zoom })
    }

    pub fn to_metadata(&self) -> String {
        format!("{},{},{}", self.lng, self.lat, self.zoom)
    }
}
