//! Oriented bounding boxes for sectors and frustum intersection
//!
//! Boxes are built from a 3x3 grid of surface samples using the local east/north/up axes
//! at the sector centroid instead of a principal-component fit. The result is roughly 10%
//! larger than a minimal box but needs only nine point evaluations.

use crate::{Globe, Sector};
use glam::{DMat4, DVec3, DVec4};

/// Length substituted for box axes that collapse to zero
const MIN_AXIS_LENGTH: f64 = 1e-6;

/// A plane `n·p + d = 0`. Points with a positive distance are on the inner side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: DVec3,
    pub distance: f64,
}

impl Plane {
    /// Build a plane and normalize it so that [`Plane::dot`] yields metric distances.
    pub fn new(normal: DVec3, distance: f64) -> Self {
        let len = normal.length();
        if len > 0.0 && len.is_finite() {
            Self {
                normal: normal / len,
                distance: distance / len,
            }
        } else {
            Self { normal, distance }
        }
    }

    fn from_vec4(v: DVec4) -> Self {
        Self::new(v.truncate(), v.w)
    }

    /// Signed distance from the plane to a point
    #[inline]
    pub fn dot(&self, point: DVec3) -> f64 {
        self.normal.dot(point) + self.distance
    }
}

/// Six inward-facing clipping planes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub left: Plane,
    pub right: Plane,
    pub bottom: Plane,
    pub top: Plane,
    pub near: Plane,
    pub far: Plane,
}

impl Frustum {
    pub fn new(
        left: Plane,
        right: Plane,
        bottom: Plane,
        top: Plane,
        near: Plane,
        far: Plane,
    ) -> Self {
        Self {
            left,
            right,
            bottom,
            top,
            near,
            far,
        }
    }

    /// Extract the planes of a combined projection × view matrix (Gribb/Hartmann).
    ///
    /// Assumes a `[0, 1]` clip-space depth range, as produced by `DMat4::perspective_rh`.
    pub fn from_view_projection(m: DMat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        Self {
            left: Plane::from_vec4(r3 + r0),
            right: Plane::from_vec4(r3 - r0),
            bottom: Plane::from_vec4(r3 + r1),
            top: Plane::from_vec4(r3 - r1),
            near: Plane::from_vec4(r2),
            far: Plane::from_vec4(r3 - r2),
        }
    }

    /// An axis-aligned box frustum enclosing `min..max`.
    pub fn from_bounds(min: DVec3, max: DVec3) -> Self {
        Self {
            left: Plane::new(DVec3::X, -min.x),
            right: Plane::new(-DVec3::X, max.x),
            bottom: Plane::new(DVec3::Y, -min.y),
            top: Plane::new(-DVec3::Y, max.y),
            near: Plane::new(DVec3::Z, -min.z),
            far: Plane::new(-DVec3::Z, max.z),
        }
    }

    /// Planes in test order: near and far first since they reject the most tiles.
    pub fn planes(&self) -> [Plane; 6] {
        [
            self.near,
            self.far,
            self.left,
            self.right,
            self.top,
            self.bottom,
        ]
    }

    pub fn contains_point(&self, point: DVec3) -> bool {
        self.planes().iter().all(|p| p.dot(point) >= 0.0)
    }
}

/// An oriented box approximating the 3D extent of a sector's terrain.
///
/// `r` is the longest axis and `t` the shortest; each is stored at full length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub center: DVec3,
    pub bottom_center: DVec3,
    pub top_center: DVec3,
    pub r: DVec3,
    pub s: DVec3,
    pub t: DVec3,
    pub radius: f64,
}

impl BoundingBox {
    /// Box around a sector whose surface lies between the given elevations.
    ///
    /// Corner samples use `min_elevation`; the edge midpoints and the centroid use
    /// `max_elevation`, which captures the bulge of the curved surface.
    pub fn from_sector(
        sector: &Sector,
        globe: &Globe,
        min_elevation: f64,
        max_elevation: f64,
    ) -> Self {
        let mut points = [DVec3::ZERO; 9];
        for (i, (lat, lon)) in sector.sample_grid().into_iter().enumerate() {
            let is_corner = matches!(i, 0 | 2 | 6 | 8);
            let elevation = if is_corner {
                min_elevation
            } else {
                max_elevation
            };
            points[i] = globe.compute_point_from_position(lat, lon, elevation);
        }

        let (c_lat, c_lon) = sector.centroid();
        let axes = [
            globe.east_tangent_at_location(c_lat, c_lon),
            globe.north_tangent_at_location(c_lat, c_lon),
            globe.surface_normal_at_location(c_lat, c_lon),
        ];

        Self::from_points_and_axes(&points, axes)
    }

    /// Box enclosing `points` along three orthonormal `axes`.
    pub fn from_points_and_axes(points: &[DVec3], axes: [DVec3; 3]) -> Self {
        let mut extents = axes.map(|axis| {
            let (min, max) = points.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
                let d = p.dot(axis);
                (lo.min(d), hi.max(d))
            });
            let length = (max - min).max(MIN_AXIS_LENGTH);
            (axis, 0.5 * (min + max), length)
        });

        // The frustum test relies on r being the most prominent axis.
        extents.sort_by(|a, b| b.2.total_cmp(&a.2));

        let center = extents
            .iter()
            .fold(DVec3::ZERO, |acc, (axis, mid, _)| acc + *axis * *mid);
        let [(ra, _, rl), (sa, _, sl), (ta, _, tl)] = extents;
        let r = ra * rl;
        let s = sa * sl;
        let t = ta * tl;

        Self {
            center,
            bottom_center: center - r * 0.5,
            top_center: center + r * 0.5,
            r,
            s,
            t,
            radius: 0.5 * (rl * rl + sl * sl + tl * tl).sqrt(),
        }
    }

    /// Whether any part of the box may lie inside the frustum.
    pub fn intersects_frustum(&self, frustum: &Frustum) -> bool {
        let mut p1 = self.bottom_center;
        let mut p2 = self.top_center;

        for plane in frustum.planes() {
            if !self.clip_to_plane(&plane, &mut p1, &mut p2) {
                return false;
            }
        }

        true
    }

    /// Half the extent of the box's two minor axes projected onto the plane normal
    #[inline]
    fn effective_radius(&self, plane: &Plane) -> f64 {
        0.5 * (self.s.dot(plane.normal).abs() + self.t.dot(plane.normal).abs())
    }

    /// Truncate the segment `p1..p2` to the part within the plane's positive half-space,
    /// inflated by the effective radius. Returns `false` if nothing is left.
    fn clip_to_plane(&self, plane: &Plane, p1: &mut DVec3, p2: &mut DVec3) -> bool {
        let eff_radius = self.effective_radius(plane);

        let dq1 = plane.dot(*p1);
        let outside1 = dq1 <= -eff_radius;
        let dq2 = plane.dot(*p2);
        let outside2 = dq2 <= -eff_radius;

        if outside1 && outside2 {
            return false;
        }
        if outside1 == outside2 {
            // Both end caps are within reach of the plane; nothing to truncate.
            return true;
        }

        let denom = plane.normal.dot(*p1 - *p2);
        if denom == 0.0 || !denom.is_finite() {
            return true;
        }
        let t = (eff_radius + dq1) / denom;
        let crossing = *p1 + (*p2 - *p1) * t;

        if outside1 {
            *p1 = crossing;
        } else {
            *p2 = crossing;
        }
        true
    }

    /// Distance from the box center to a point, minus the bounding-sphere radius.
    pub fn distance_to(&self, point: DVec3) -> f64 {
        (self.center.distance(point) - self.radius).max(0.0)
    }
}
