//! Core type aliases and re-exports

pub use glam::{
    Vec3, Vec4,
    DVec3,
    Mat4,
    Quat,
};

/// Node index inside a dataset's implicit N-ary tree (root = 0)
pub type NodeId = u32;

/// Index of a registered dataset
pub type DatasetId = u32;

/// Index of a registered viewpoint
pub type ViewId = u32;

/// Index of a rendering context (one GPU-resident buffer each)
pub type ContextId = u32;

/// Index of a fixed-size cache slot
pub type SlotId = u32;

/// Reference-set key for slot acquisition, combining context and view
pub type ViewerId = u32;

/// Pack a (context, view) pair into the key used for slot reference sets
pub fn viewer_id(context: ContextId, view: ViewId) -> ViewerId {
    ((context & 0xFFFF) << 16) | (view & 0xFFFF)
}

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;
