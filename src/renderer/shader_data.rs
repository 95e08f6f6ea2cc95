use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Data unique to each draw call passed as a push constant
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub data: Vec4,
    pub render_matrix: Mat4,
}

impl MeshPushConstants {
    pub const SIZE: u32 = size_of::<Self>() as u32;

    pub fn new(render_matrix: Mat4) -> Self {
        Self {
            data: Vec4::ZERO,
            render_matrix,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
