//! Simulated camera descending towards a target on the globe

use glam::DMat4;
use globe_imagery_lib::{FrameState, Frustum, Globe};

/// Geometric descent from `start_altitude` to `end_altitude` over `frames` frames
#[derive(Debug, Clone, Copy)]
pub struct FlightPath {
    pub target_lat: f64,
    pub target_lon: f64,
    pub start_altitude: f64,
    pub end_altitude: f64,
    pub frames: u32,
}

impl FlightPath {
    /// Altitude at `frame`; constant relative speed makes the descent look uniform on screen
    pub fn altitude_at(&self, frame: u32) -> f64 {
        let t = if self.frames <= 1 {
            1.0
        } else {
            (frame.min(self.frames - 1) as f64) / (self.frames - 1) as f64
        };
        let start = self.start_altitude.max(1.0);
        let end = self.end_altitude.max(1.0);
        start * (end / start).powf(t)
    }
}

/// A perspective camera looking straight down at the surface
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub globe: Globe,
    /// Vertical field of view in radians
    pub fov_y: f64,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Camera {
    pub fn frame_state(&self, lat: f64, lon: f64, altitude: f64) -> FrameState {
        let eye = self.globe.compute_point_from_position(lat, lon, altitude);
        let target = self.globe.compute_point_from_position(lat, lon, 0.0);
        let up = self.globe.north_tangent_at_location(lat, lon);

        let aspect = self.viewport_width.max(1) as f64 / self.viewport_height.max(1) as f64;
        let near = (altitude * 0.1).max(1.0);
        // Nothing past the horizon is visible
        let horizon = (altitude * (2.0 * self.globe.equatorial_radius + altitude)).sqrt();
        let far = horizon * 1.1 + near;

        let view = DMat4::look_at_rh(eye, target, up);
        let projection = DMat4::perspective_rh(self.fov_y, aspect, near, far);
        let frustum = Frustum::from_view_projection(projection * view);

        FrameState::perspective(frustum, eye, self.fov_y, self.viewport_height as f64)
    }
}
