// SPDX-License-Identifier: Apache-2.0

//! Quadkey and slippy-tile arithmetic on the spherical web-mercator grid.
//!
//! Pure functions, no I/O. All conversions use the standard spherical
//! projection (EPSG:3857, radius 6378137) with no datum correction.

use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

/// WGS84 equatorial radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
/// Half the mercator plane extent in meters (`PI * EARTH_RADIUS_M`).
pub const ORIGIN_SHIFT_M: f64 = PI * EARTH_RADIUS_M;
/// Latitude beyond which the mercator projection is undefined.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;
/// Deepest zoom accepted; keeps `2^z` comfortably inside `u32`.
pub const MAX_ZOOM: u8 = 30;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TileMathError {
    InvalidTile { x: u32, y: u32, z: u8 },
    InvalidQuadkey(String),
    InvalidLonLat { lon: f64, lat: f64 },
}

impl Display for TileMathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTile { x, y, z } => {
                write!(f, "tile ({x},{y}) does not exist at zoom {z}")
            }
            Self::InvalidQuadkey(qk) => write!(f, "invalid quadkey {qk:?}"),
            Self::InvalidLonLat { lon, lat } => {
                write!(f, "coordinate ({lon},{lat}) outside geographic bounds")
            }
        }
    }
}

impl std::error::Error for TileMathError {}

fn check_tile(x: u32, y: u32, z: u8) -> Result<(), TileMathError> {
    if z > MAX_ZOOM {
        return Err(TileMathError::InvalidTile { x, y, z });
    }
    let n = 1_u64 << z;
    if u64::from(x) >= n || u64::from(y) >= n {
        return Err(TileMathError::InvalidTile { x, y, z });
    }
    Ok(())
}

/// Encodes `(x, y, z)` as a base-4 quadkey of length `z`.
pub fn tile_to_quadkey(x: u32, y: u32, z: u8) -> Result<String, TileMathError> {
    check_tile(x, y, z)?;
    let mut quadkey = String::with_capacity(z as usize);
    for i in (1..=z).rev() {
        let mask = 1_u32 << (i - 1);
        let mut digit = 0_u8;
        if x & mask != 0 {
            digit += 1;
        }
        if y & mask != 0 {
            digit += 2;
        }
        quadkey.push(char::from(b'0' + digit));
    }
    Ok(quadkey)
}

/// Decodes a quadkey back to `(x, y, z)`. The empty string is rejected:
/// zoom zero has exactly one tile and no digits to address it with.
pub fn quadkey_to_tile(quadkey: &str) -> Result<(u32, u32, u8), TileMathError> {
    if quadkey.is_empty() || quadkey.len() > MAX_ZOOM as usize {
        return Err(TileMathError::InvalidQuadkey(quadkey.to_string()));
    }
    let mut x = 0_u32;
    let mut y = 0_u32;
    for c in quadkey.chars() {
        x <<= 1;
        y <<= 1;
        match c {
            '0' => {}
            '1' => x |= 1,
            '2' => y |= 1,
            '3' => {
                x |= 1;
                y |= 1;
            }
            _ => return Err(TileMathError::InvalidQuadkey(quadkey.to_string())),
        }
    }
    Ok((x, y, quadkey.len() as u8))
}

/// Geographic bounds of a tile as `(min_lon, min_lat, max_lon, max_lat)`
/// in degrees.
pub fn tile_bounds(x: u32, y: u32, z: u8) -> Result<(f64, f64, f64, f64), TileMathError> {
    check_tile(x, y, z)?;
    let n = f64::from(1_u32 << z);
    let min_lon = f64::from(x) / n * 360.0 - 180.0;
    let max_lon = (f64::from(x) + 1.0) / n * 360.0 - 180.0;
    let max_lat = tile_row_to_lat(f64::from(y), n);
    let min_lat = tile_row_to_lat(f64::from(y) + 1.0, n);
    Ok((min_lon, min_lat, max_lon, max_lat))
}

fn tile_row_to_lat(row: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * row / n)).sinh().atan().to_degrees()
}

/// Web-mercator envelope of a tile as `(min_x, min_y, max_x, max_y)` in
/// meters.
pub fn tile_envelope_meters(x: u32, y: u32, z: u8) -> Result<(f64, f64, f64, f64), TileMathError> {
    check_tile(x, y, z)?;
    let n = f64::from(1_u32 << z);
    let span = 2.0 * ORIGIN_SHIFT_M / n;
    let min_x = f64::from(x) * span - ORIGIN_SHIFT_M;
    let max_x = (f64::from(x) + 1.0) * span - ORIGIN_SHIFT_M;
    let max_y = ORIGIN_SHIFT_M - f64::from(y) * span;
    let min_y = ORIGIN_SHIFT_M - (f64::from(y) + 1.0) * span;
    Ok((min_x, min_y, max_x, max_y))
}

/// Projects a lon/lat pair to web-mercator meters. Latitude is clamped to
/// the mercator singularity before projecting.
#[must_use]
pub fn lon_lat_to_meters(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = lon / 180.0 * ORIGIN_SHIFT_M;
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() / PI * ORIGIN_SHIFT_M;
    (x, y)
}

/// Tile containing a geographic point at zoom `z`.
pub fn lon_lat_to_tile(lon: f64, lat: f64, z: u8) -> Result<(u32, u32), TileMathError> {
    if z > MAX_ZOOM || !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(TileMathError::InvalidLonLat { lon, lat });
    }
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let n = f64::from(1_u32 << z);
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();
    let last = (1_u32 << z) - 1;
    Ok((
        (x as i64).clamp(0, i64::from(last)) as u32,
        (y as i64).clamp(0, i64::from(last)) as u32,
    ))
}
