// SPDX-License-Identifier: Apache-2.0

use predtile_core::tilemath::{self, TileMathError};

/// MVT grid resolution.
pub const TILE_EXTENT: u32 = 4096;
/// Clip bounds extend this far past the tile edge so polygons crossing a
/// tile boundary render without seams.
pub const TILE_BUFFER: f64 = 256.0;

/// Projects a lon/lat vertex into tile-local coordinates for `(x, y, z)`.
/// Output may fall outside `[0, extent]`; callers clip afterwards. MVT y
/// grows southward, so the mercator y axis is flipped.
pub fn world_to_tile_coords(
    lon: f64,
    lat: f64,
    x: u32,
    y: u32,
    z: u8,
) -> Result<(f64, f64), TileMathError> {
    let (min_x, min_y, max_x, max_y) = tilemath::tile_envelope_meters(x, y, z)?;
    let (merc_x, merc_y) = tilemath::lon_lat_to_meters(lon, lat);
    let extent = f64::from(TILE_EXTENT);
    let tile_x = ((merc_x - min_x) / (max_x - min_x)) * extent;
    let tile_y = extent - ((merc_y - min_y) / (max_y - min_y)) * extent;
    Ok((tile_x, tile_y))
}

/// Sutherland-Hodgman clip of one ring against the buffered tile square.
/// Interpolates intersection points where edges cross the bounds, so
/// boundary-crossing polygons keep their true shape instead of the
/// stair-step a coordinate clamp would produce.
pub fn clip_ring(ring: &[(f64, f64)], extent: f64, buffer: f64) -> Vec<(f64, f64)> {
    if ring.is_empty() {
        return Vec::new();
    }
    let min_bound = -buffer;
    let max_bound = extent + buffer;

    let mut output = ring.to_vec();
    output = clip_against_edge(&output, |p| p.0 >= min_bound, |p1, p2| {
        let t = (min_bound - p1.0) / (p2.0 - p1.0);
        (min_bound, p1.1 + t * (p2.1 - p1.1))
    });
    output = clip_against_edge(&output, |p| p.0 <= max_bound, |p1, p2| {
        let t = (max_bound - p1.0) / (p2.0 - p1.0);
        (max_bound, p1.1 + t * (p2.1 - p1.1))
    });
    output = clip_against_edge(&output, |p| p.1 >= min_bound, |p1, p2| {
        let t = (min_bound - p1.1) / (p2.1 - p1.1);
        (p1.0 + t * (p2.0 - p1.0), min_bound)
    });
    output = clip_against_edge(&output, |p| p.1 <= max_bound, |p1, p2| {
        let t = (max_bound - p1.1) / (p2.1 - p1.1);
        (p1.0 + t * (p2.0 - p1.0), max_bound)
    });
    output
}

fn clip_against_edge<F, I>(polygon: &[(f64, f64)], inside: F, intersect: I) -> Vec<(f64, f64)>
where
    F: Fn(&(f64, f64)) -> bool,
    I: Fn(&(f64, f64), &(f64, f64)) -> (f64, f64),
{
    if polygon.is_empty() {
        return Vec::new();
    }
    let mut output = Vec::new();
    let n = polygon.len();
    for i in 0..n {
        let current = &polygon[i];
        let next = &polygon[(i + 1) % n];
        let current_inside = inside(current);
        let next_inside = inside(next);
        if current_inside {
            if next_inside {
                output.push(*next);
            } else {
                output.push(intersect(current, next));
            }
        } else if next_inside {
            output.push(intersect(current, next));
            output.push(*next);
        }
    }
    output
}

/// Rounds a clipped ring onto the integer grid and drops the collapsed
/// duplicates rounding creates. Returns `None` when fewer than three
/// distinct vertices survive.
pub fn quantize_ring(ring: &[(f64, f64)]) -> Option<Vec<(i32, i32)>> {
    let mut out: Vec<(i32, i32)> = Vec::with_capacity(ring.len());
    for &(x, y) in ring {
        let point = (x.round() as i32, y.round() as i32);
        if out.last() != Some(&point) {
            out.push(point);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    if out.len() < 3 {
        return None;
    }
    Some(out)
}

/// Normalizes ring winding for MVT encoding: exterior rings must carry
/// positive shoelace area in tile coordinates (y grows down). Source
/// geometry arrives in either geographic winding, so a ring that encodes
/// as an interior ring is reversed in place.
pub fn orient_exterior(ring: &mut [(i32, i32)]) {
    let n = ring.len();
    let mut doubled_area = 0_i64;
    for i in 0..n {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % n];
        doubled_area += i64::from(x1) * i64::from(y2) - i64::from(x2) * i64::from(y1);
    }
    if doubled_area < 0 {
        ring.reverse();
    }
}
