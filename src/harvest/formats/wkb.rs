//! Little-endian WKB encoding for the two geometry types we emit.
//!
//! Shared by the GeoPackage writer (wrapped in a GP header) and the
//! PostGIS writer (passed to `ST_GeomFromWKB`).

use crate::model::Coord;

const LITTLE_ENDIAN: u8 = 1;
const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;

pub fn point(coord: Coord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21);
    header(&mut buf, WKB_POINT);
    push_coord(&mut buf, coord);
    buf
}

pub fn linestring(coords: &[Coord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + coords.len() * 16);
    header(&mut buf, WKB_LINESTRING);
    buf.extend_from_slice(&(coords.len() as u32).to_le_bytes());
    for coord in coords {
        push_coord(&mut buf, *coord);
    }
    buf
}

/// Bounding box as `(min_lon, min_lat, max_lon, max_lat)`.
pub fn envelope<'a, I>(coords: I) -> Option<(f64, f64, f64, f64)>
where
    I: IntoIterator<Item = &'a Coord>,
{
    coords.into_iter().fold(None, |acc, c| {
        Some(match acc {
            None => (c.lon, c.lat, c.lon, c.lat),
            Some((min_x, min_y, max_x, max_y)) => (
                min_x.min(c.lon),
                min_y.min(c.lat),
                max_x.max(c.lon),
                max_y.max(c.lat),
            ),
        })
    })
}

fn header(buf: &mut Vec<u8>, geometry_type: u32) {
    buf.push(LITTLE_ENDIAN);
    buf.extend_from_slice(&geometry_type.to_le_bytes());
}

fn push_coord(buf: &mut Vec<u8>, coord: Coord) {
    buf.extend_from_slice(&coord.lon.to_le_bytes());
    buf.extend_from_slice(&coord.lat.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_layout() {
        let wkb = point(Coord::new(12.5, 41.9));
        assert_eq!(wkb.len(), 21);
        assert_eq!(wkb[0], 1);
        assert_eq!(&wkb[1..5], &1u32.to_le_bytes());
        assert_eq!(&wkb[5..13], &12.5f64.to_le_bytes());
        assert_eq!(&wkb[13..21], &41.9f64.to_le_bytes());
    }

    #[test]
    fn test_linestring_layout() {
        let coords = vec![Coord::new(0.0, 1.0), Coord::new(2.0, 3.0)];
        let wkb = linestring(&coords);
        assert_eq!(wkb.len(), 9 + 32);
        assert_eq!(&wkb[1..5], &2u32.to_le_bytes());
        assert_eq!(&wkb[5..9], &2u32.to_le_bytes());
        assert_eq!(&wkb[33..41], &3.0f64.to_le_bytes());
    }

    #[test]
    fn test_envelope() {
        let coords = vec![Coord::new(3.0, -1.0), Coord::new(-2.0, 4.0), Coord::new(1.0, 0.0)];
        assert_eq!(envelope(&coords), Some((-2.0, -1.0, 3.0, 4.0)));
        assert_eq!(envelope(&Vec::<Coord>::new()), None);
    }
}
