//! Screen-space error of hierarchy nodes

use crate::core::camera::ViewCamera;
use crate::core::types::{Mat4, Vec3};
use crate::hierarchy::Hierarchy;
use crate::math::{Culling, Frustum};

/// Threshold band around which split and collapse decisions do not flip
pub const HYSTERESIS: f32 = 0.1;

/// Per (view, dataset) inputs for error evaluation
#[derive(Clone, Copy, Debug)]
pub struct ErrorMetric {
    model_view: Mat4,
    frustum: Frustum,
    near: f32,
    pixels_per_unit: f32,
    radius_scale: f32,
}

impl ErrorMetric {
    pub fn new(camera: &ViewCamera, model: &Mat4) -> Self {
        let radius_scale = model.x_axis.truncate().length();
        Self {
            model_view: camera.view_matrix() * *model,
            frustum: camera.frustum_for(model),
            near: camera.near,
            pixels_per_unit: camera.height_divided_by_top_minus_bottom(),
            radius_scale,
        }
    }

    /// Projected size in pixels of an average primitive of `node`
    pub fn node_error(&self, hierarchy: &Hierarchy, node: u32) -> f32 {
        let radius = hierarchy.avg_extent(node) * self.radius_scale;
        let view_pos: Vec3 = self.model_view.transform_point3(hierarchy.centroid(node));
        // Nodes around or behind the eye are treated as touching the near plane
        let distance = (-view_pos.z).max(self.near);
        (2.0 * radius * (self.near / distance) * self.pixels_per_unit).abs()
    }

    /// Outside the frustum, or flagged invisible
    pub fn is_culled(&self, hierarchy: &Hierarchy, node: u32) -> bool {
        !hierarchy.is_visible(node) || self.frustum.classify(&hierarchy.bounds(node)) == Culling::Outside
    }

    /// A node may split when it has children and none of them would
    /// fall below the lower threshold band.
    pub fn should_split(&self, hierarchy: &Hierarchy, node: u32, threshold: f32) -> bool {
        if hierarchy.is_leaf(node) {
            return false;
        }
        hierarchy
            .child_range(node)
            .all(|c| self.node_error(hierarchy, c) >= threshold - HYSTERESIS)
    }
}

/// Model matrix of a dataset: user transform after the hierarchy's translation
pub fn model_matrix(transform: &Mat4, hierarchy: &Hierarchy) -> Mat4 {
    *transform * Mat4::from_translation(hierarchy.translation().as_vec3())
}
