//! What the renderer is asked to create and draw.

use ash::vk;
use crate::renderer::pipeline::{PipelineDescriptor, PipelineLayoutDescriptor, PipelineVariant};

/// Produces the push-constant bytes of a draw from the frame number and the render extent
pub type PushConstantFn = Box<dyn Fn(u64, vk::Extent2D) -> Vec<u8>>;

pub struct PipelineRequest {
    pub name: String,
    /// Index into [`SceneDescription::layouts`]
    pub layout: usize,
    pub variant: PipelineVariant,
}

pub struct MeshRequest {
    pub name: String,
    pub bytes: Vec<u8>,
    pub vertex_count: u32,
}

impl MeshRequest {
    pub fn from_vertices<T: bytemuck::Pod>(name: &str, vertices: &[T]) -> Self {
        Self {
            name: name.to_owned(),
            bytes: bytemuck::cast_slice(vertices).to_vec(),
            vertex_count: vertices.len() as u32,
        }
    }
}

/// Something drawn every frame.
///
/// An object with several pipelines draws with one of them at a time;
/// `Renderer::cycle_variant` switches to the next.
pub struct ObjectRequest {
    pub pipelines: Vec<String>,
    pub mesh: Option<String>,
    /// Ignored when the object draws a mesh
    pub vertex_count: u32,
    pub push_constants: Option<(vk::ShaderStageFlags, PushConstantFn)>,
}

impl ObjectRequest {
    pub fn new(pipelines: &[&str], vertex_count: u32) -> Self {
        Self {
            pipelines: pipelines.iter().map(|name| name.to_string()).collect(),
            mesh: None,
            vertex_count,
            push_constants: None,
        }
    }

    pub fn with_mesh(mut self, mesh: &str) -> Self {
        self.mesh = Some(mesh.to_owned());
        self
    }

    pub fn with_push_constants<F>(mut self, stages: vk::ShaderStageFlags, producer: F) -> Self
    where
        F: Fn(u64, vk::Extent2D) -> Vec<u8> + 'static,
    {
        self.push_constants = Some((stages, Box::new(producer)));
        self
    }
}

/// The pipelines, meshes and objects of one scene, all sharing a base descriptor
pub struct SceneDescription {
    pub base: PipelineDescriptor,
    pub layouts: Vec<PipelineLayoutDescriptor>,
    pub pipelines: Vec<PipelineRequest>,
    pub meshes: Vec<MeshRequest>,
    pub objects: Vec<ObjectRequest>,
}

impl SceneDescription {
    pub fn new(base: PipelineDescriptor) -> Self {
        Self {
            base,
            layouts: Vec::new(),
            pipelines: Vec::new(),
            meshes: Vec::new(),
            objects: Vec::new(),
        }
    }

    pub fn with_layout(mut self, layout: PipelineLayoutDescriptor) -> Self {
        self.layouts.push(layout);
        self
    }

    pub fn with_pipeline(mut self, name: &str, layout: usize, variant: PipelineVariant) -> Self {
        self.pipelines.push(PipelineRequest {
            name: name.to_owned(),
            layout,
            variant,
        });
        self
    }

    pub fn with_mesh(mut self, mesh: MeshRequest) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn with_object(mut self, object: ObjectRequest) -> Self {
        self.objects.push(object);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::vertex::Vertex;
    use glam::Vec3;

    #[test]
    fn test_mesh_from_vertices_counts_vertices() {
        let vertices = [Vertex::default(), Vertex { position: Vec3::X, ..Default::default() }];
        let mesh = MeshRequest::from_vertices("pair", &vertices);
        assert_eq!(mesh.vertex_count, 2);
        assert_eq!(mesh.bytes.len(), 72);
    }

    #[test]
    fn test_object_keeps_pipeline_order() {
        let object = ObjectRequest::new(&["red", "colored"], 3).with_mesh("tri");
        assert_eq!(object.pipelines, vec!["red".to_string(), "colored".to_string()]);
        assert_eq!(object.mesh.as_deref(), Some("tri"));
        assert!(object.push_constants.is_none());
    }
}
