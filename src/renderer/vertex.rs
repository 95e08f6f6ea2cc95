use std::mem::{offset_of, size_of};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Binding and attribute layout of the vertex buffers a pipeline reads
#[derive(Debug, Clone, Default)]
pub struct VertexInputDescription {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub flags: vk::PipelineVertexInputStateCreateFlags,
}

impl VertexInputDescription {
    /// Pipelines that generate their vertices in the shader read no buffers
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.attributes.is_empty()
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

impl Vertex {
    pub fn input_description() -> VertexInputDescription {
        // One interleaved buffer, advanced per vertex
        let binding = vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX);

        let attribute = |location: u32, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset as u32)
        };

        VertexInputDescription {
            bindings: vec![binding],
            attributes: vec![
                attribute(0, offset_of!(Self, position)),
                attribute(1, offset_of!(Self, normal)),
                attribute(2, offset_of!(Self, color)),
            ],
            flags: vk::PipelineVertexInputStateCreateFlags::empty(),
        }
    }
}
