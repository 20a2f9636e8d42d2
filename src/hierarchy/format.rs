//! On-disk layout of a hierarchy file
//!
//! ```text
//! header (44 bytes, little endian)
//!   u32 fan_factor
//!   u32 depth
//!   u32 node_count
//!   u32 primitives_per_node
//!   u32 primitive_byte_size
//!   f64 translation[3]
//! node_count x NodeRecord (44 bytes each)
//! ```

use bytemuck::{Pod, Zeroable};
use glam::DVec3;

use super::HierarchyError;
use crate::math::Aabb;
use crate::core::types::Vec3;

/// Size of the fixed file header in bytes
pub const HEADER_SIZE: usize = 5 * 4 + 3 * 8;

/// Size of one per-node record in bytes
pub const NODE_RECORD_SIZE: usize = std::mem::size_of::<NodeRecord>();

/// Fixed file header
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileHeader {
    pub fan_factor: u32,
    pub depth: u32,
    pub node_count: u32,
    pub primitives_per_node: u32,
    pub primitive_byte_size: u32,
    pub translation: DVec3,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let words = [
            self.fan_factor,
            self.depth,
            self.node_count,
            self.primitives_per_node,
            self.primitive_byte_size,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        for (i, t) in self.translation.to_array().iter().enumerate() {
            let at = 20 + i * 8;
            out[at..at + 8].copy_from_slice(&t.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HierarchyError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HierarchyError::Truncated { expected: HEADER_SIZE, found: bytes.len() });
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(b)
        };
        let double = |i: usize| {
            let at = 20 + i * 8;
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            f64::from_le_bytes(b)
        };
        Ok(Self {
            fan_factor: word(0),
            depth: word(1),
            node_count: word(2),
            primitives_per_node: word(3),
            primitive_byte_size: word(4),
            translation: DVec3::new(double(0), double(1), double(2)),
        })
    }
}

/// Per-node bounding and error data
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct NodeRecord {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub centroid: [f32; 3],
    pub avg_extent: f32,
    pub visible: u32,
}

impl NodeRecord {
    pub fn new(bounds: Aabb, centroid: Vec3, avg_extent: f32, visible: bool) -> Self {
        Self {
            min: bounds.min.to_array(),
            max: bounds.max.to_array(),
            centroid: centroid.to_array(),
            avg_extent,
            visible: visible as u32,
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
    }

    pub fn centroid(&self) -> Vec3 {
        Vec3::from_array(self.centroid)
    }

    pub fn is_visible(&self) -> bool {
        self.visible != 0
    }
}
