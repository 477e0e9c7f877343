//! Geographic math shared by the road graph, the spatial index
//! and the interference-graph builder.

use cgmath::{InnerSpace, Vector2};
use serde::{Deserialize, Serialize};

/// Mean radius of the Earth in m.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Metres per degree of latitude in the flat snapshot projection.
pub const METRES_PER_DEGREE: f64 = 111_000.0;

/// An offset in the local projected plane, in m.
pub type PlaneVec = Vector2<f64>;

/// A geographic position in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPos {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPos {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Great-circle distance between two positions in m.
///
/// Uses the equirectangular approximation when both deltas are below 0.02°
/// and the haversine formula otherwise.
pub fn distance(a: GeoPos, b: GeoPos) -> f64 {
    let d_lat = b.lat - a.lat;
    let d_lon = b.lon - a.lon;

    if d_lat.abs() < 0.02 && d_lon.abs() < 0.02 {
        let x = d_lon.to_radians() * ((a.lat + b.lat) / 2.0).to_radians().cos();
        let y = d_lat.to_radians();
        return EARTH_RADIUS_M * (x * x + y * y).sqrt();
    }

    let d_lat = d_lat.to_radians();
    let d_lon = d_lon.to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Offset from `from` to `to` in the flat 111 000 m/° projection.
///
/// Longitude is scaled by the cosine of the reference latitude `from.lat`,
/// not the midpoint, so swapping the arguments yields a slightly different
/// magnitude for far-apart points. The interference builder depends on this
/// exact form; do not symmetrise it.
pub fn plane_offset(from: GeoPos, to: GeoPos) -> PlaneVec {
    let dy = (to.lat - from.lat) * METRES_PER_DEGREE;
    let dx = (to.lon - from.lon) * METRES_PER_DEGREE * from.lat.to_radians().cos();
    PlaneVec::new(dx, dy)
}

/// Distance between two positions in the flat projection, in m.
pub fn plane_distance(from: GeoPos, to: GeoPos) -> f64 {
    plane_offset(from, to).magnitude()
}

/// Normalises an angle in degrees to `[0, 360)`.
pub fn normalize_heading(deg: f64) -> f64 {
    let deg = deg % 360.0;
    if deg < 0.0 {
        deg + 360.0
    } else {
        deg
    }
}

/// Signed shortest rotation from `current` to `target` in degrees,
/// in `[-180, 180]`. Both inputs must already be normalised.
pub fn heading_delta(target: f64, current: f64) -> f64 {
    let mut diff = target - current;
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff < -180.0 {
        diff += 360.0;
    }
    diff
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn one_degree_of_latitude() {
        let a = GeoPos::new(48.0, 7.75);
        let b = GeoPos::new(49.0, 7.75);
        assert_approx_eq!(distance(a, b), 111_194.9, 10.0);
    }

    #[test]
    fn small_offsets_use_the_approximation() {
        let a = GeoPos::new(48.5734, 7.7521);
        let b = GeoPos::new(48.5735, 7.7521);
        assert_approx_eq!(distance(a, b), 11.1, 0.1);
        assert_approx_eq!(distance(a, b), distance(b, a), 1e-9);
    }

    #[test]
    fn plane_distance_matches_flat_constant() {
        let a = GeoPos::new(48.5734, 7.7521);
        let b = GeoPos::new(48.5740, 7.7521);
        assert_approx_eq!(plane_distance(a, b), 0.0006 * METRES_PER_DEGREE, 1e-6);
    }

    #[test]
    fn plane_distance_is_asymmetric_for_distant_points() {
        let a = GeoPos::new(40.0, 2.0);
        let b = GeoPos::new(55.0, 9.0);
        let ab = plane_distance(a, b);
        let ba = plane_distance(b, a);
        assert!((ab - ba).abs() > 1.0, "expected asymmetry, got {ab} vs {ba}");
    }

    #[test]
    fn heading_normalisation() {
        assert_approx_eq!(normalize_heading(-90.0), 270.0);
        assert_approx_eq!(normalize_heading(360.0), 0.0);
        assert_approx_eq!(normalize_heading(725.0), 5.0);
    }

    #[test]
    fn heading_deltas_take_the_short_way() {
        assert_approx_eq!(heading_delta(350.0, 10.0), -20.0);
        assert_approx_eq!(heading_delta(10.0, 350.0), 20.0);
        assert_approx_eq!(heading_delta(180.0, 0.0), 180.0);
    }
}
