//! One-time creation of everything the frame loop needs.
//!
//! Each step acquires into its own ledger. A step that succeeds is absorbed into the
//! renderer's ledger as one entry; a step that fails releases what it already acquired
//! before returning, so the renderer's ledger only ever holds completed steps.

use std::collections::HashMap;
use std::sync::Arc;
use ash::vk;
use crate::renderer::backend::RenderBackend;
use crate::renderer::error::RenderError;
use crate::renderer::frame::FrameState;
use crate::renderer::ledger::ResourceLedger;
use crate::renderer::pipeline::{CompiledPipeline, PipelineAssembler, RenderPassTarget};
use crate::renderer::scene::{MeshRequest, SceneDescription};

/// A vertex buffer on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMesh {
    pub buffer: vk::Buffer,
    pub vertex_count: u32,
}

pub struct SetupSequencer<'a, B: RenderBackend> {
    backend: &'a Arc<B>,
    ledger: &'a mut ResourceLedger,
}

impl<'a, B: RenderBackend> SetupSequencer<'a, B> {
    pub fn new(backend: &'a Arc<B>, ledger: &'a mut ResourceLedger) -> Self {
        Self { backend, ledger }
    }

    /// Command pool and buffer, the frame fence (created signaled) and both semaphores
    pub fn create_frame_primitives(&mut self, queue_family: u32) -> Result<FrameState, RenderError> {
        self.run_step("frame primitives", |backend, scope| {
            let pool = backend
                .create_command_pool(queue_family)
                .map_err(RenderError::acquisition("command pool"))?;
            scope.register("command pool", release(backend, move |b| b.destroy_command_pool(pool)));

            // Freed together with its pool
            let command_buffer = backend
                .allocate_command_buffer(pool)
                .map_err(RenderError::acquisition("command buffer"))?;

            let fence = backend
                .create_fence(true)
                .map_err(RenderError::acquisition("render fence"))?;
            scope.register("render fence", release(backend, move |b| b.destroy_fence(fence)));

            let acquire_semaphore = backend
                .create_semaphore()
                .map_err(RenderError::acquisition("acquire semaphore"))?;
            scope.register(
                "acquire semaphore",
                release(backend, move |b| b.destroy_semaphore(acquire_semaphore)),
            );

            let render_semaphore = backend
                .create_semaphore()
                .map_err(RenderError::acquisition("render semaphore"))?;
            scope.register(
                "render semaphore",
                release(backend, move |b| b.destroy_semaphore(render_semaphore)),
            );

            Ok(FrameState::new(command_buffer, fence, acquire_semaphore, render_semaphore))
        })
    }

    /// Pipeline layouts, then every requested pipeline.
    ///
    /// A pipeline that fails to compile is logged and kept as the null pipeline; the
    /// step only fails when a layout cannot be created.
    pub fn create_pipelines(
        &mut self,
        target: &RenderPassTarget,
        scene: &SceneDescription,
    ) -> Result<HashMap<String, CompiledPipeline>, RenderError> {
        self.run_step("pipelines", |backend, scope| {
            let mut layouts = Vec::with_capacity(scene.layouts.len());
            for descriptor in &scene.layouts {
                let layout = backend
                    .create_pipeline_layout(descriptor)
                    .map_err(RenderError::acquisition("pipeline layout"))?;
                scope.register(
                    "pipeline layout",
                    release(backend, move |b| b.destroy_pipeline_layout(layout)),
                );
                layouts.push(layout);
            }

            let assembler = PipelineAssembler::new(backend.as_ref(), target);
            let mut pipelines = HashMap::with_capacity(scene.pipelines.len());
            for request in &scene.pipelines {
                let layout = layouts
                    .get(request.layout)
                    .copied()
                    .unwrap_or_else(vk::PipelineLayout::null);
                let variant = request.variant.clone().with_pipeline_layout(layout);

                let compiled = match assembler.compile(&scene.base, &variant) {
                    Ok(compiled) => {
                        let pipeline = compiled.pipeline;
                        scope.register(
                            "pipeline",
                            release(backend, move |b| b.destroy_pipeline(pipeline)),
                        );
                        compiled
                    }
                    Err(err) => {
                        log::error!("Pipeline '{}' is unavailable: {}", request.name, err);
                        CompiledPipeline {
                            pipeline: vk::Pipeline::null(),
                            layout,
                        }
                    }
                };
                pipelines.insert(request.name.clone(), compiled);
            }

            Ok(pipelines)
        })
    }

    /// One host-visible vertex buffer per mesh
    pub fn upload_meshes(
        &mut self,
        meshes: &[MeshRequest],
    ) -> Result<HashMap<String, GpuMesh>, RenderError> {
        self.run_step("meshes", |backend, scope| {
            let mut uploaded = HashMap::with_capacity(meshes.len());
            for mesh in meshes {
                let buffer = backend
                    .create_vertex_buffer(&mesh.bytes)
                    .map_err(RenderError::acquisition("vertex buffer"))?;
                scope.register("vertex buffer", release(backend, move |b| b.destroy_buffer(buffer)));
                log::debug!("Uploaded mesh '{}' ({} vertices)", mesh.name, mesh.vertex_count);

                uploaded.insert(mesh.name.clone(), GpuMesh {
                    buffer,
                    vertex_count: mesh.vertex_count,
                });
            }
            Ok(uploaded)
        })
    }

    fn run_step<T, F>(&mut self, name: &'static str, step: F) -> Result<T, RenderError>
    where
        F: FnOnce(&Arc<B>, &mut ResourceLedger) -> Result<T, RenderError>,
    {
        let mut scope = ResourceLedger::new();
        match step(self.backend, &mut scope) {
            Ok(value) => {
                log::debug!("Setup step '{}' acquired {} resources", name, scope.len());
                self.ledger.absorb(name, scope);
                Ok(value)
            }
            Err(err) => {
                log::error!("Setup step '{}' failed: {}", name, err);
                scope.flush();
                Err(err)
            }
        }
    }
}

/// A teardown action holding its own reference to the backend
fn release<B, F>(backend: &Arc<B>, action: F) -> impl FnOnce() + use<B, F>
where
    B: RenderBackend,
    F: FnOnce(&B) + 'static,
{
    let backend = Arc::clone(backend);
    move || action(&backend)
}
