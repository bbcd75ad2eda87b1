//! Geographic primitives shared by all engines. Distances are great-circle
//! kilometers; road-network correction happens in the distance estimators.

use serde::{Deserialize, Serialize};

/// Mean earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to `other` in kilometers.
    pub fn haversine_km(&self, other: &Coordinate) -> f64 {
        let lat_a = self.lat.to_radians();
        let lat_b = other.lat.to_radians();
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }

    /// Shortest distance in kilometers from this point to the segment `a`-`b`,
    /// using a local equirectangular projection. Accurate enough at city scale
    /// which is the only scale routes operate on.
    pub fn distance_to_segment_km(&self, a: &Coordinate, b: &Coordinate) -> f64 {
        let (px, py) = project(self, a);
        let (bx, by) = project(b, a);

        let len_sq = bx * bx + by * by;
        if len_sq == 0.0 {
            return self.haversine_km(a);
        }
        let t = ((px * bx + py * by) / len_sq).max(0.0).min(1.0);
        let dx = px - t * bx;
        let dy = py - t * by;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Project `point` into kilometers east/north of `origin`.
fn project(point: &Coordinate, origin: &Coordinate) -> (f64, f64) {
    let x = (point.lng - origin.lng).to_radians()
        * origin.lat.to_radians().cos()
        * EARTH_RADIUS_KM;
    let y = (point.lat - origin.lat).to_radians() * EARTH_RADIUS_KM;
    (x, y)
}

/// Axis-aligned bounding box over coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    min: Coordinate,
    max: Coordinate,
}

impl BoundingBox {
    /// The bounding box of the given points, or `None` when empty.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Coordinate>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = *points.next()?;
        let mut result = BoundingBox {
            min: first,
            max: first,
        };
        for point in points {
            result.expand(point);
        }
        Some(result)
    }

    pub fn expand(&mut self, point: &Coordinate) {
        self.min.lat = self.min.lat.min(point.lat);
        self.min.lng = self.min.lng.min(point.lng);
        self.max.lat = self.max.lat.max(point.lat);
        self.max.lng = self.max.lng.max(point.lng);
    }

    /// Diagonal of the box in kilometers.
    pub fn diagonal_km(&self) -> f64 {
        self.min.haversine_km(&self.max)
    }

    /// Whether `point` lies inside the box, grown by `margin_km` on all sides.
    pub fn contains(&self, point: &Coordinate, margin_km: f64) -> bool {
        // One degree of latitude is ~111km; longitude shrinks with latitude.
        let lat_margin = margin_km / 111.0;
        let lng_margin = margin_km / (111.0 * self.min.lat.to_radians().cos().abs().max(0.01));
        point.lat >= self.min.lat - lat_margin
            && point.lat <= self.max.lat + lat_margin
            && point.lng >= self.min.lng - lng_margin
            && point.lng <= self.max.lng + lng_margin
    }
}
