//! Bounding volumes and culling

pub mod aabb;
pub mod frustum;

pub use aabb::Aabb;
pub use frustum::{Culling, Frustum, Plane};
