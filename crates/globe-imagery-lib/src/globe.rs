//! Ellipsoidal globe model and the elevation-model contract

use crate::Sector;
use glam::DVec3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// WGS84 equatorial radius in meters
pub const WGS84_EQUATORIAL_RADIUS: f64 = 6_378_137.0;

/// WGS84 polar radius in meters
pub const WGS84_POLAR_RADIUS: f64 = 6_356_752.3142;

/// WGS84 first eccentricity squared
pub const WGS84_ECCENTRICITY_SQUARED: f64 = 0.00669437999013;

/// An ellipsoid of revolution in an Earth-centered, Earth-fixed frame.
///
/// Axes: `+X` through (0°, 0°), `+Y` through (0°, 90°E), `+Z` through the north pole.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Globe {
    pub equatorial_radius: f64,
    pub polar_radius: f64,
    pub eccentricity_squared: f64,
}

impl Default for Globe {
    fn default() -> Self {
        Self::wgs84()
    }
}

impl Globe {
    pub fn wgs84() -> Self {
        Self {
            equatorial_radius: WGS84_EQUATORIAL_RADIUS,
            polar_radius: WGS84_POLAR_RADIUS,
            eccentricity_squared: WGS84_ECCENTRICITY_SQUARED,
        }
    }

    /// A perfect sphere, handy for tests where exact distances matter
    pub fn sphere(radius: f64) -> Self {
        Self {
            equatorial_radius: radius,
            polar_radius: radius,
            eccentricity_squared: 0.0,
        }
    }

    /// Convert a geodetic position (degrees, meters above the ellipsoid) to Cartesian.
    #[inline]
    pub fn compute_point_from_position(&self, lat: f64, lon: f64, elevation: f64) -> DVec3 {
        let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon.to_radians().sin_cos();

        // Radius of curvature in the prime vertical
        let rpm = self.equatorial_radius
            / (1.0 - self.eccentricity_squared * sin_lat * sin_lat).sqrt();

        DVec3::new(
            (rpm + elevation) * cos_lat * cos_lon,
            (rpm + elevation) * cos_lat * sin_lon,
            (rpm * (1.0 - self.eccentricity_squared) + elevation) * sin_lat,
        )
    }

    /// Unit vector normal to the ellipsoid surface at the location
    #[inline]
    pub fn surface_normal_at_location(&self, lat: f64, lon: f64) -> DVec3 {
        let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon.to_radians().sin_cos();
        DVec3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat)
    }

    /// Unit vector tangent to the surface pointing north
    #[inline]
    pub fn north_tangent_at_location(&self, lat: f64, lon: f64) -> DVec3 {
        let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon.to_radians().sin_cos();
        DVec3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat)
    }

    /// Unit vector tangent to the surface pointing east
    #[inline]
    pub fn east_tangent_at_location(&self, _lat: f64, lon: f64) -> DVec3 {
        let (sin_lon, cos_lon) = lon.to_radians().sin_cos();
        DVec3::new(-sin_lon, cos_lon, 0.0)
    }
}

/// Supplies terrain elevation extremes for bounding-volume construction.
pub trait ElevationModel {
    /// Minimum and maximum elevation in meters within the sector
    fn min_and_max_elevation(&self, sector: &Sector) -> (f64, f64);

    /// Changes whenever the elevations returned above may have changed.
    fn version(&self) -> u64 {
        0
    }
}

/// Flat terrain between two fixed elevations
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConstantElevation {
    pub min: f64,
    pub max: f64,
}

impl ConstantElevation {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl ElevationModel for ConstantElevation {
    fn min_and_max_elevation(&self, _sector: &Sector) -> (f64, f64) {
        (self.min, self.max)
    }
}
