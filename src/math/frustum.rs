//! View frustum for culling node bounds

use super::aabb::Aabb;
use crate::core::types::{Mat4, Vec3, Vec4};

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    fn from_coefficients(v: Vec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len <= f32::EPSILON {
            return Self { normal: Vec3::ZERO, distance: v.w };
        }
        Self { normal: normal / len, distance: v.w / len }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Relation of a bounding box to the frustum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Culling {
    Outside,
    Intersecting,
    Inside,
}

/// View frustum with 6 planes (Near, Far, Left, Right, Top, Bottom)
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from a (model-)view-projection matrix.
    ///
    /// Planes live in the input space of the matrix, so passing
    /// `proj * view * model` yields a frustum in model space.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);

        // glam uses a [0, 1] depth range, so near is row2 alone
        Self {
            planes: [
                Plane::from_coefficients(r2),
                Plane::from_coefficients(r3 - r2),
                Plane::from_coefficients(r3 + r0),
                Plane::from_coefficients(r3 - r0),
                Plane::from_coefficients(r3 - r1),
                Plane::from_coefficients(r3 + r1),
            ],
        }
    }

    /// Check if point is inside frustum
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance_to_point(point) >= 0.0)
    }

    /// Classify an AABB against all six planes
    pub fn classify(&self, aabb: &Aabb) -> Culling {
        let mut result = Culling::Inside;
        for plane in &self.planes {
            let n = plane.normal;
            let positive = Vec3::new(
                if n.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if n.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if n.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            if plane.distance_to_point(positive) < 0.0 {
                return Culling::Outside;
            }
            let negative = Vec3::new(
                if n.x >= 0.0 { aabb.min.x } else { aabb.max.x },
                if n.y >= 0.0 { aabb.min.y } else { aabb.max.y },
                if n.z >= 0.0 { aabb.min.z } else { aabb.max.z },
            );
            if plane.distance_to_point(negative) < 0.0 {
                result = Culling::Intersecting;
            }
        }
        result
    }

    /// Check if AABB intersects frustum (conservative test)
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.classify(aabb) != Culling::Outside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frustum() -> Frustum {
        let proj = Mat4::perspective_rh(60.0_f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn test_plane_distance() {
        let plane = Plane::new(Vec3::Y, 0.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, 5.0, 0.0)), 5.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, -3.0, 0.0)), -3.0);
    }

    #[test]
    fn test_contains_point() {
        let frustum = test_frustum();
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 10.0)));
    }

    #[test]
    fn test_classify() {
        let frustum = test_frustum();

        let small = Aabb::from_center_half_extent(Vec3::ZERO, Vec3::splat(0.1));
        assert_eq!(frustum.classify(&small), Culling::Inside);

        let behind = Aabb::from_center_half_extent(Vec3::new(0.0, 0.0, 20.0), Vec3::ONE);
        assert_eq!(frustum.classify(&behind), Culling::Outside);

        let straddling = Aabb::from_center_half_extent(Vec3::new(0.0, 0.0, 5.0), Vec3::ONE);
        assert_eq!(frustum.classify(&straddling), Culling::Intersecting);
    }

    #[test]
    fn test_far_to_the_side() {
        let frustum = test_frustum();
        let side = Aabb::from_center_half_extent(Vec3::new(50.0, 0.0, 0.0), Vec3::ONE);
        assert!(!frustum.intersects_aabb(&side));
    }
}
