use ash::vk;
use color_eyre::Result;
use glam::{Mat4, Vec3};
use ember::renderer::pipeline::{PipelineDescriptor, PipelineLayoutDescriptor, PipelineVariant};
use ember::renderer::scene::{MeshRequest, ObjectRequest, SceneDescription};
use ember::renderer::shader_data::MeshPushConstants;
use ember::renderer::vertex::Vertex;
use crate::app::bootstrap::VulkanContext;

const CAMERA_POSITION: Vec3 = Vec3::new(0.0, 0.0, -2.0);
const FOV_Y_DEGREES: f32 = 70.0;
const MESH_SPIN_DEGREES_PER_FRAME: f32 = 0.4;

/// Two switchable shader-generated triangles and a spinning triangle mesh
pub fn build_scene(context: &mut VulkanContext) -> Result<SceneDescription> {
    let triangle_vert = context.load_shader_module("triangle.vert")?;
    let triangle_frag = context.load_shader_module("triangle.frag")?;
    let colored_vert = context.load_shader_module("colored_triangle.vert")?;
    let colored_frag = context.load_shader_module("colored_triangle.frag")?;
    let mesh_vert = context.load_shader_module("mesh.vert")?;

    let base = PipelineDescriptor::new(context.extent)
        .with_input_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .with_polygon_mode(vk::PolygonMode::FILL)
        .with_multisampling_disabled()
        .with_color_attachments(1);

    let mesh_variant = PipelineVariant::from_modules(mesh_vert, colored_frag)
        .with_vertex_input(Vertex::input_description());

    let scene = SceneDescription::new(base)
        .with_layout(PipelineLayoutDescriptor::new())
        .with_layout(
            PipelineLayoutDescriptor::new()
                .with_push_constants(vk::ShaderStageFlags::VERTEX, MeshPushConstants::SIZE),
        )
        .with_pipeline("red_triangle", 0, PipelineVariant::from_modules(triangle_vert, triangle_frag))
        .with_pipeline("colored_triangle", 0, PipelineVariant::from_modules(colored_vert, colored_frag))
        .with_pipeline("mesh", 1, mesh_variant)
        .with_mesh(MeshRequest::from_vertices("triangle", &triangle_mesh()))
        .with_object(ObjectRequest::new(&["red_triangle", "colored_triangle"], 3))
        .with_object(
            ObjectRequest::new(&["mesh"], 0)
                .with_mesh("triangle")
                .with_push_constants(vk::ShaderStageFlags::VERTEX, |frame_number, extent| {
                    MeshPushConstants::new(mesh_matrix(frame_number, extent))
                        .as_bytes()
                        .to_vec()
                }),
        );

    Ok(scene)
}

fn triangle_mesh() -> [Vertex; 3] {
    let green = Vec3::new(0.0, 1.0, 0.0);
    [
        Vertex { position: Vec3::new(1.0, 1.0, 0.0), normal: Vec3::Z, color: green },
        Vertex { position: Vec3::new(-1.0, 1.0, 0.0), normal: Vec3::Z, color: green },
        Vertex { position: Vec3::new(0.0, -1.0, 0.0), normal: Vec3::Z, color: green },
    ]
}

fn mesh_matrix(frame_number: u64, extent: vk::Extent2D) -> Mat4 {
    let view = Mat4::from_translation(CAMERA_POSITION);

    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut projection = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, 0.1, 200.0);
    // Vulkan clip space has Y pointing down
    projection.y_axis.y *= -1.0;

    let angle = (frame_number as f32 * MESH_SPIN_DEGREES_PER_FRAME).to_radians();
    let model = Mat4::from_axis_angle(Vec3::Y, angle);

    projection * view * model
}
