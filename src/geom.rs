use serde::{Deserialize, Serialize};

/// Quantisation factor for latitudes: 27 bits over the -90..+90 range
pub const LAT_CONVERSION_FACTOR: f64 = 134_217_727.0 / 180.0;
/// Quantisation factor for longitudes: 27 bits over the -180..+180 range
pub const LON_CONVERSION_FACTOR: f64 = 134_217_727.0 / 360.0;

/// A geographic coordinate in double-precision degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    pub lat: f64,
    pub lon: f64,
}

impl GeoCoord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Quantise into the two 27-bit unsigned encodings used by every on-disk
    /// coordinate in the database
    pub fn encode(&self) -> (u32, u32) {
        let lat = ((self.lat + 90.0) * LAT_CONVERSION_FACTOR).round() as u32;
        let lon = ((self.lon + 180.0) * LON_CONVERSION_FACTOR).round() as u32;
        (lat, lon)
    }

    pub fn decode(lat: u32, lon: u32) -> Self {
        Self {
            lat: lat as f64 / LAT_CONVERSION_FACTOR - 90.0,
            lon: lon as f64 / LON_CONVERSION_FACTOR - 180.0,
        }
    }

    /// The canonical 64-bit object id for a coordinate: a byte-group
    /// interleave of the two quantised encodings, keeping nearby coordinates
    /// on a common high-bit prefix, shifted left by 8 for the serial
    /// disambiguator.
    pub fn object_id(&self, serial: u8) -> u64 {
        let (lat_value, lon_value) = self.encode();
        let lat_value = lat_value as u64;
        let lon_value = lon_value as u64;

        let id = ((lat_value & 0x0000_00ff) << 8)
            + (lon_value & 0x0000_00ff)
            + ((lat_value & 0x0000_ff00) << 16)
            + ((lon_value & 0x0000_ff00) << 8)
            + ((lat_value & 0x00ff_0000) << 24)
            + ((lon_value & 0x00ff_0000) << 16)
            + ((lat_value & 0x0700_0000) << 27)
            + ((lon_value & 0x0700_0000) << 24);

        (id << 8) | serial as u64
    }

    /// Recover the coordinate from an id produced by [`GeoCoord::object_id`]
    pub fn from_object_id(id: u64) -> (Self, u8) {
        let serial = (id & 0xff) as u8;
        let id = id >> 8;

        let lat_value = ((id >> 8) & 0xff)
            | (((id >> 24) & 0xff) << 8)
            | (((id >> 40) & 0xff) << 16)
            | (((id >> 51) & 0x07) << 24);
        let lon_value = (id & 0xff)
            | (((id >> 16) & 0xff) << 8)
            | (((id >> 32) & 0xff) << 16)
            | (((id >> 48) & 0x07) << 24);

        (Self::decode(lat_value as u32, lon_value as u32), serial)
    }
}

/// Geographic bounding box accumulated from coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub min: GeoCoord,
    pub max: GeoCoord,
    valid: bool,
}

impl Default for GeoBox {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoBox {
    pub fn new() -> Self {
        Self {
            min: GeoCoord::new(90.0, 180.0),
            max: GeoCoord::new(-90.0, -180.0),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn include(&mut self, coord: GeoCoord) {
        self.min.lat = self.min.lat.min(coord.lat);
        self.min.lon = self.min.lon.min(coord.lon);
        self.max.lat = self.max.lat.max(coord.lat);
        self.max.lon = self.max.lon.max(coord.lon);
        self.valid = true;
    }

    pub fn include_box(&mut self, other: &GeoBox) {
        if other.valid {
            self.include(other.min);
            self.include(other.max);
        }
    }

    pub fn contains(&self, coord: GeoCoord) -> bool {
        self.valid
            && coord.lat >= self.min.lat
            && coord.lat <= self.max.lat
            && coord.lon >= self.min.lon
            && coord.lon <= self.max.lon
    }

    pub fn contains_box(&self, other: &GeoBox) -> bool {
        self.valid && other.valid && self.contains(other.min) && self.contains(other.max)
    }

    pub fn center(&self) -> GeoCoord {
        GeoCoord::new(
            (self.min.lat + self.max.lat) / 2.0,
            (self.min.lon + self.max.lon) / 2.0,
        )
    }
}

/// A cell in the tile grid of a given magnification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Width of a grid cell in degrees of longitude at the given magnification
pub fn cell_width(level: u32) -> f64 {
    360.0 / (1u64 << level) as f64
}

/// Height of a grid cell in degrees of latitude at the given magnification
pub fn cell_height(level: u32) -> f64 {
    180.0 / (1u64 << level) as f64
}

/// The tile containing a coordinate at the given magnification
pub fn tile_of(coord: GeoCoord, level: u32) -> TileId {
    let max = (1u64 << level) - 1;
    let x = ((coord.lon + 180.0) / cell_width(level)) as u64;
    let y = ((coord.lat + 90.0) / cell_height(level)) as u64;
    TileId::new(x.min(max) as u32, y.min(max) as u32)
}

/// Inclusive tile range covered by a bounding box at the given magnification
pub fn tile_range(bbox: &GeoBox, level: u32) -> (TileId, TileId) {
    (tile_of(bbox.min, level), tile_of(bbox.max, level))
}

/// Linearised sort key of a tile, row-major
pub fn tile_number(tile: TileId, level: u32) -> u64 {
    (tile.y as u64) * (1u64 << level) + tile.x as u64
}

/// Ray-cast test of a point against a closed polygon ring
pub fn point_in_ring(coord: GeoCoord, ring: &[GeoCoord]) -> bool {
    if ring.is_empty() {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;

    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[j];

        if (a.lat > coord.lat) != (b.lat > coord.lat) {
            let x = (b.lon - a.lon) * (coord.lat - a.lat) / (b.lat - a.lat) + a.lon;
            if coord.lon < x {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Approximate distance between two coordinates in meters
pub fn distance_meters(a: GeoCoord, b: GeoCoord) -> f64 {
    let lat = (a.lat - b.lat).to_radians();
    let lon = (a.lon - b.lon).to_radians();
    let mean_lat = ((a.lat + b.lat) / 2.0).to_radians();

    let x = lon * mean_lat.cos();
    6_371_000.0 * (x * x + lat * lat).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_round_trips_within_quantisation_step() {
        let coord = GeoCoord::new(51.5074, -0.1278);
        let (lat, lon) = coord.encode();
        let decoded = GeoCoord::decode(lat, lon);

        assert!((decoded.lat - coord.lat).abs() <= 1.0 / LAT_CONVERSION_FACTOR);
        assert!((decoded.lon - coord.lon).abs() <= 1.0 / LON_CONVERSION_FACTOR);
    }

    #[test]
    fn encode_handles_extreme_coordinates() {
        let (lat, lon) = GeoCoord::new(90.0, 180.0).encode();
        assert_eq!(lat, 134_217_727);
        assert_eq!(lon, 134_217_727);
        assert!(lat < (1 << 27));
        assert!(lon < (1 << 27));

        let (lat, lon) = GeoCoord::new(-90.0, -180.0).encode();
        assert_eq!(lat, 0);
        assert_eq!(lon, 0);
    }

    #[test]
    fn object_id_round_trips() {
        for (lat, lon) in [(51.5074, -0.1278), (90.0, 180.0), (-90.0, -180.0), (0.0, 0.0)] {
            let coord = GeoCoord::new(lat, lon);
            let id = coord.object_id(3);
            let (decoded, serial) = GeoCoord::from_object_id(id);

            assert_eq!(serial, 3);
            assert!((decoded.lat - coord.lat).abs() <= 1.0 / LAT_CONVERSION_FACTOR);
            assert!((decoded.lon - coord.lon).abs() <= 1.0 / LON_CONVERSION_FACTOR);
        }
    }

    #[test]
    fn object_id_preserves_prefix_locality() {
        let a = GeoCoord::new(51.50, 13.40).object_id(0);
        let near = GeoCoord::new(51.50001, 13.40001).object_id(0);
        let far = GeoCoord::new(-33.86, 151.21).object_id(0);

        assert!((a ^ near).leading_zeros() > (a ^ far).leading_zeros());
    }

    #[test]
    fn bounding_box_accumulates() {
        let mut bbox = GeoBox::new();
        assert!(!bbox.is_valid());

        bbox.include(GeoCoord::new(51.5, -0.1));
        assert!(bbox.is_valid());
        assert_eq!(bbox.min, GeoCoord::new(51.5, -0.1));
        assert_eq!(bbox.max, GeoCoord::new(51.5, -0.1));

        bbox.include(GeoCoord::new(48.1, 11.5));
        assert_eq!(bbox.min, GeoCoord::new(48.1, -0.1));
        assert_eq!(bbox.max, GeoCoord::new(51.5, 11.5));
    }

    #[test]
    fn tiles_cover_the_grid() {
        let tile = tile_of(GeoCoord::new(0.0, 0.0), 1);
        assert_eq!(tile, TileId::new(1, 1));

        // The extreme corner stays inside the grid
        let tile = tile_of(GeoCoord::new(90.0, 180.0), 4);
        assert_eq!(tile, TileId::new(15, 15));
    }

    #[test]
    fn point_in_ring_basic() {
        let ring = vec![
            GeoCoord::new(0.0, 0.0),
            GeoCoord::new(0.0, 10.0),
            GeoCoord::new(10.0, 10.0),
            GeoCoord::new(10.0, 0.0),
        ];

        assert!(point_in_ring(GeoCoord::new(5.0, 5.0), &ring));
        assert!(!point_in_ring(GeoCoord::new(15.0, 5.0), &ring));
    }
}
