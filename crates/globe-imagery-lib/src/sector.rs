//! Geographic sectors (latitude/longitude rectangles in degrees)

use geo::{Coord, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An axis-aligned latitude/longitude rectangle, in degrees.
///
/// Backed by a [`geo::Rect`] with `x` = longitude and `y` = latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sector {
    rect: Rect<f64>,
}

impl Sector {
    /// The whole globe: latitude -90..90, longitude -180..180
    pub fn full_sphere() -> Self {
        Self::new(-90.0, 90.0, -180.0, 180.0)
    }

    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            rect: Rect::new(
                Coord {
                    x: min_lon,
                    y: min_lat,
                },
                Coord {
                    x: max_lon,
                    y: max_lat,
                },
            ),
        }
    }

    #[inline]
    pub fn min_latitude(&self) -> f64 {
        self.rect.min().y
    }

    #[inline]
    pub fn max_latitude(&self) -> f64 {
        self.rect.max().y
    }

    #[inline]
    pub fn min_longitude(&self) -> f64 {
        self.rect.min().x
    }

    #[inline]
    pub fn max_longitude(&self) -> f64 {
        self.rect.max().x
    }

    #[inline]
    pub fn delta_latitude(&self) -> f64 {
        self.rect.height()
    }

    #[inline]
    pub fn delta_longitude(&self) -> f64 {
        self.rect.width()
    }

    /// Centroid as `(latitude, longitude)`
    pub fn centroid(&self) -> (f64, f64) {
        let c = self.rect.center();
        (c.y, c.x)
    }

    /// Area in square degrees
    pub fn area(&self) -> f64 {
        self.delta_latitude() * self.delta_longitude()
    }

    pub fn as_rect(&self) -> &Rect<f64> {
        &self.rect
    }

    /// Whether the sector has non-finite bounds, zero extent or lies outside the globe.
    pub fn is_degenerate(&self) -> bool {
        let bounds = [
            self.min_latitude(),
            self.max_latitude(),
            self.min_longitude(),
            self.max_longitude(),
        ];
        if bounds.iter().any(|v| !v.is_finite()) {
            return true;
        }
        self.delta_latitude() <= 0.0
            || self.delta_longitude() <= 0.0
            || self.min_latitude() < -90.0
            || self.max_latitude() > 90.0
    }

    /// Intersection of two sectors, or `None` if they only touch or are disjoint.
    pub fn intersection(&self, other: &Sector) -> Option<Sector> {
        let min_lat = self.min_latitude().max(other.min_latitude());
        let max_lat = self.max_latitude().min(other.max_latitude());
        let min_lon = self.min_longitude().max(other.min_longitude());
        let max_lon = self.max_longitude().min(other.max_longitude());

        if min_lat < max_lat && min_lon < max_lon {
            Some(Sector::new(min_lat, max_lat, min_lon, max_lon))
        } else {
            None
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_latitude()
            && lat <= self.max_latitude()
            && lon >= self.min_longitude()
            && lon <= self.max_longitude()
    }

    /// The 3x3 grid of sample locations used for bounding volumes, row-major from the
    /// south-west corner, as `(latitude, longitude)`.
    pub(crate) fn sample_grid(&self) -> [(f64, f64); 9] {
        let (c_lat, c_lon) = self.centroid();
        let lats = [self.min_latitude(), c_lat, self.max_latitude()];
        let lons = [self.min_longitude(), c_lon, self.max_longitude()];

        let mut out = [(0.0, 0.0); 9];
        for (i, lat) in lats.iter().enumerate() {
            for (j, lon) in lons.iter().enumerate() {
                out[i * 3 + j] = (*lat, *lon);
            }
        }
        out
    }
}
