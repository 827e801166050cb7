pub mod bounds;
pub mod terrain;
pub mod tile;

pub use bounds::{Center, LngLatBounds};
pub use terrain::TerrainEncoding;
pub use tile::{StoredCoord, TileCoord, TileRange, tile_range, tms_row};
