//! Camera submitted per view for cut analysis

use crate::core::types::{Mat4, Quat, Vec3};
use crate::math::Frustum;

/// Viewpoint used to cull and score hierarchy nodes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewCamera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
    /// Viewport height in pixels
    pub viewport_height: f32,
}

impl ViewCamera {
    /// Create a camera looking down -Z
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32, viewport_height: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.01,
            far: 1000.0,
            viewport_height,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            position,
            rotation,
            fov_y: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.01,
            far: 1000.0,
            viewport_height: 1080.0,
        }
    }

    /// Builder-style viewport height
    pub fn with_viewport_height(mut self, height: f32) -> Self {
        self.viewport_height = height;
        self
    }

    /// Builder-style field of view
    pub fn with_fov_degrees(mut self, fov_y_degrees: f32) -> Self {
        self.fov_y = fov_y_degrees.to_radians();
        self
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Frustum expressed in the space of `model`, so node bounds can be
    /// tested without transforming them.
    pub fn frustum_for(&self, model: &Mat4) -> Frustum {
        Frustum::from_view_projection(&(self.view_projection() * *model))
    }

    /// Pixels per world unit on the near plane.
    pub fn height_divided_by_top_minus_bottom(&self) -> f32 {
        let top = self.near * (self.fov_y * 0.5).tan();
        self.viewport_height / (2.0 * top)
    }

    /// Update aspect ratio and viewport height (call on window resize)
    pub fn set_viewport(&mut self, width: f32, height: f32) {
        self.aspect = width / height;
        self.viewport_height = height;
    }
}

impl Default for ViewCamera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 16.0 / 9.0, 1080.0)
    }
}
