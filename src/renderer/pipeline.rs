//! Graphics pipeline assembly.
//!
//! A [`PipelineDescriptor`] holds the fixed-function state shared by several pipelines.
//! Each pipeline is compiled from that base plus a [`PipelineVariant`] carrying its shader
//! stages, so two pipelines that share state are `compile(&base, &a)` and `compile(&base, &b)`.

use std::ffi::{CStr, CString};
use ash::vk;
use smallvec::SmallVec;
use crate::renderer::backend::RenderBackend;
use crate::renderer::error::PipelineError;
use crate::renderer::vertex::VertexInputDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStageKind {
    Vertex,
    Fragment,
}

impl ShaderStageKind {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub kind: ShaderStageKind,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

impl ShaderStage {
    pub fn new(kind: ShaderStageKind, module: vk::ShaderModule) -> Self {
        Self {
            kind,
            module,
            entry: c"main".to_owned(),
        }
    }

    pub fn with_entry(mut self, entry: &CStr) -> Self {
        self.entry = entry.to_owned();
        self
    }
}

/// Per-pipeline part of a pipeline: its shader stages and optional overrides of the base state
#[derive(Debug, Clone, Default)]
pub struct PipelineVariant {
    stages: SmallVec<[ShaderStage; 2]>,
    layout: Option<vk::PipelineLayout>,
    vertex_input: Option<VertexInputDescription>,
}

impl PipelineVariant {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual vertex + fragment pair, both entering at `main`
    pub fn from_modules(vert: vk::ShaderModule, frag: vk::ShaderModule) -> Self {
        Self::new()
            .with_stage(ShaderStage::new(ShaderStageKind::Vertex, vert))
            .with_stage(ShaderStage::new(ShaderStageKind::Fragment, frag))
    }

    pub fn with_stage(mut self, stage: ShaderStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_pipeline_layout(mut self, layout: vk::PipelineLayout) -> Self {
        let _ = self.layout.replace(layout);
        self
    }

    pub fn with_vertex_input(mut self, description: VertexInputDescription) -> Self {
        let _ = self.vertex_input.replace(description);
        self
    }

    pub fn stages(&self) -> &[ShaderStage] {
        &self.stages
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultisampleState {
    pub samples: vk::SampleCountFlags,
    pub sample_shading: bool,
    pub min_sample_shading: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
}

/// Attachments of the render pass a pipeline is compiled against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassTarget {
    pub render_pass: vk::RenderPass,
    pub color_attachment_count: u32,
    pub has_depth_attachment: bool,
}

/// Layout state shared by every pipeline compiled from it
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub vertex_input: VertexInputDescription,
    pub topology: vk::PrimitiveTopology,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub rasterization: RasterizationState,
    pub multisample: MultisampleState,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub layout: vk::PipelineLayout,
}

impl PipelineDescriptor {
    /// Triangle lists, filled, no culling, no multisampling, one opaque color target
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            vertex_input: VertexInputDescription::empty(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            viewport: Self::full_viewport(extent),
            scissor: Self::full_scissor(extent),
            rasterization: RasterizationState {
                polygon_mode: vk::PolygonMode::FILL,
                cull_mode: vk::CullModeFlags::NONE,
                front_face: vk::FrontFace::CLOCKWISE,
                line_width: 1.0,
            },
            multisample: MultisampleState {
                samples: vk::SampleCountFlags::TYPE_1,
                sample_shading: false,
                min_sample_shading: 1.0,
            },
            color_blend_attachments: vec![Self::opaque_blend_attachment()],
            depth_stencil: None,
            layout: vk::PipelineLayout::null(),
        }
    }

    pub fn with_input_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.rasterization.polygon_mode = mode;
        self.rasterization.line_width = 1.0;
        self
    }

    pub fn with_cull_mode(
        mut self,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
    ) -> Self {
        self.rasterization.cull_mode = cull_mode;
        self.rasterization.front_face = front_face;
        self
    }

    pub fn with_viewport_extent(mut self, extent: vk::Extent2D) -> Self {
        self.viewport = Self::full_viewport(extent);
        self.scissor = Self::full_scissor(extent);
        self
    }

    pub fn with_multisampling_disabled(mut self) -> Self {
        // 1 sample per pixel means no multisampling
        self.multisample = MultisampleState {
            samples: vk::SampleCountFlags::TYPE_1,
            sample_shading: false,
            min_sample_shading: 1.0,
        };
        self
    }

    /// One opaque blend attachment per color target of the render pass
    pub fn with_color_attachments(mut self, count: u32) -> Self {
        self.color_blend_attachments = vec![Self::opaque_blend_attachment(); count as usize];
        self
    }

    // Make sure the transparent object is rendered AFTER the opaque ones
    pub fn with_alpha_blending_enabled(mut self) -> Self {
        for blend in &mut self.color_blend_attachments {
            blend.blend_enable = vk::TRUE;
            blend.src_color_blend_factor = vk::BlendFactor::SRC_ALPHA;
            blend.dst_color_blend_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;
            blend.color_blend_op = vk::BlendOp::ADD;
            blend.src_alpha_blend_factor = vk::BlendFactor::ONE;
            blend.dst_alpha_blend_factor = vk::BlendFactor::ZERO;
            blend.alpha_blend_op = vk::BlendOp::ADD;
        }
        self
    }

    pub fn with_depth_test(mut self, compare: Option<vk::CompareOp>) -> Self {
        self.depth_stencil = Some(DepthStencilState {
            depth_test: true,
            depth_write: true,
            compare_op: compare.unwrap_or(vk::CompareOp::LESS_OR_EQUAL),
        });
        self
    }

    pub fn without_depth_stencil(mut self) -> Self {
        self.depth_stencil = None;
        self
    }

    pub fn with_pipeline_layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_vertex_input(mut self, description: VertexInputDescription) -> Self {
        self.vertex_input = description;
        self
    }

    fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }
    }

    fn opaque_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
        // Default RGBA write mask, no blending
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
    }
}

/// Push-constant ranges and descriptor-set layouts of a pipeline layout
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDescriptor {
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

impl PipelineLayoutDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_push_constants(mut self, stages: vk::ShaderStageFlags, size: u32) -> Self {
        let offset = self
            .push_constant_ranges
            .last()
            .map_or(0, |range| range.offset + range.size);
        self.push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(stages)
                .offset(offset)
                .size(size),
        );
        self
    }

    pub fn with_set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }
}

/// A base descriptor merged with a variant, validated and ready for the driver
pub struct ResolvedPipeline<'a> {
    pub descriptor: &'a PipelineDescriptor,
    pub stages: &'a [ShaderStage],
    pub layout: vk::PipelineLayout,
    pub vertex_input: &'a VertexInputDescription,
}

/// A pipeline and the layout it was built with. The default value is the null pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompiledPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl CompiledPipeline {
    pub fn is_null(&self) -> bool {
        self.pipeline == vk::Pipeline::null()
    }
}

/// Compiles pipelines against one render pass.
///
/// The assembler never registers teardown; whoever keeps the pipeline owns its release.
pub struct PipelineAssembler<'a, B: RenderBackend + ?Sized> {
    backend: &'a B,
    target: &'a RenderPassTarget,
}

impl<'a, B: RenderBackend + ?Sized> PipelineAssembler<'a, B> {
    pub fn new(backend: &'a B, target: &'a RenderPassTarget) -> Self {
        Self { backend, target }
    }

    pub fn compile(
        &self,
        base: &PipelineDescriptor,
        variant: &PipelineVariant,
    ) -> Result<CompiledPipeline, PipelineError> {
        let resolved = self.resolve(base, variant)?;
        let pipeline = self
            .backend
            .create_graphics_pipeline(&resolved, self.target)
            .map_err(PipelineError::Driver)?;

        if pipeline == vk::Pipeline::null() {
            return Err(PipelineError::Driver(vk::Result::ERROR_UNKNOWN));
        }

        log::debug!("Compiled pipeline {:?}", pipeline);
        Ok(CompiledPipeline {
            pipeline,
            layout: resolved.layout,
        })
    }

    /// Like [`compile`](Self::compile), but logs the failure and returns a null pipeline
    pub fn compile_or_null(
        &self,
        base: &PipelineDescriptor,
        variant: &PipelineVariant,
    ) -> vk::Pipeline {
        match self.compile(base, variant) {
            Ok(compiled) => compiled.pipeline,
            Err(err) => {
                log::error!("Failed to create pipeline ({}): {}", err.status(), err);
                vk::Pipeline::null()
            }
        }
    }

    fn resolve<'d>(
        &self,
        base: &'d PipelineDescriptor,
        variant: &'d PipelineVariant,
    ) -> Result<ResolvedPipeline<'d>, PipelineError> {
        for kind in [ShaderStageKind::Vertex, ShaderStageKind::Fragment] {
            match variant.stages.iter().filter(|stage| stage.kind == kind).count() {
                0 => return Err(PipelineError::MissingStage(kind)),
                1 => {}
                _ => return Err(PipelineError::DuplicateStage(kind)),
            }
        }

        let layout = variant.layout.unwrap_or(base.layout);
        if layout == vk::PipelineLayout::null() {
            return Err(PipelineError::MissingLayout);
        }

        let blend_count = base.color_blend_attachments.len() as u32;
        if blend_count != self.target.color_attachment_count {
            return Err(PipelineError::BlendAttachmentMismatch {
                expected: self.target.color_attachment_count,
                found: blend_count,
            });
        }

        if base.depth_stencil.is_some() != self.target.has_depth_attachment {
            return Err(PipelineError::DepthStateMismatch {
                has_depth_state: base.depth_stencil.is_some(),
                pass_has_depth: self.target.has_depth_attachment,
            });
        }

        Ok(ResolvedPipeline {
            descriptor: base,
            stages: &variant.stages,
            layout,
            vertex_input: variant.vertex_input.as_ref().unwrap_or(&base.vertex_input),
        })
    }
}
