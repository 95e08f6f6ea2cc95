pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod pipeline;
pub mod scene;
pub mod setup;
pub mod shader_data;
pub mod vertex;

use std::collections::HashMap;
use std::sync::Arc;
use ash::vk;
use crate::renderer::backend::{DisplaySurface, RenderBackend};
use crate::renderer::config::RenderConfig;
use crate::renderer::error::RenderError;
use crate::renderer::frame::{
    DrawCall, FrameOutcome, FramePlan, FrameSynchronizer, PushConstants, RenderTargets,
    SkipReason,
};
use crate::renderer::ledger::ResourceLedger;
use crate::renderer::pipeline::CompiledPipeline;
use crate::renderer::scene::{ObjectRequest, PushConstantFn, SceneDescription};
use crate::renderer::setup::{GpuMesh, SetupSequencer};

struct RenderObject {
    variants: Vec<CompiledPipeline>,
    active: usize,
    mesh: Option<GpuMesh>,
    vertex_count: u32,
    push_constants: Option<(vk::ShaderStageFlags, PushConstantFn)>,
}

impl RenderObject {
    fn resolve(
        request: ObjectRequest,
        pipelines: &HashMap<String, CompiledPipeline>,
        meshes: &HashMap<String, GpuMesh>,
    ) -> Self {
        let variants = request
            .pipelines
            .iter()
            .map(|name| {
                pipelines.get(name).copied().unwrap_or_else(|| {
                    log::warn!("Object uses unknown pipeline '{}'", name);
                    CompiledPipeline::default()
                })
            })
            .collect();

        let mesh = request.mesh.as_ref().and_then(|name| {
            let mesh = meshes.get(name).copied();
            if mesh.is_none() {
                log::warn!("Object uses unknown mesh '{}'", name);
            }
            mesh
        });

        Self {
            variants,
            active: 0,
            vertex_count: mesh.map_or(request.vertex_count, |mesh| mesh.vertex_count),
            mesh,
            push_constants: request.push_constants,
        }
    }

    fn draw_call(&self, frame_number: u64, extent: vk::Extent2D) -> DrawCall {
        DrawCall {
            pipeline: self.variants.get(self.active).copied().unwrap_or_default(),
            vertex_buffer: self.mesh.map(|mesh| mesh.buffer),
            vertex_count: self.vertex_count,
            push_constants: self.push_constants.as_ref().map(|(stages, producer)| PushConstants {
                stages: *stages,
                bytes: producer(frame_number, extent),
            }),
        }
    }
}

/// Owns every GPU resource of a scene and draws it one frame at a time.
///
/// Resources are released in reverse acquisition order by [`shutdown`](Self::shutdown),
/// which also runs on drop. The backend must stay alive until then; the renderer holds
/// its own `Arc` to it.
pub struct Renderer<B: RenderBackend> {
    backend: Arc<B>,
    config: RenderConfig,
    ledger: ResourceLedger,

    synchronizer: Option<FrameSynchronizer>,
    targets: RenderTargets,
    objects: Vec<RenderObject>,

    ready: bool,
    setup_error: Option<RenderError>,
}

impl<B: RenderBackend> Renderer<B> {
    /// Runs every setup step. A failed step is logged and leaves the renderer not ready;
    /// whatever earlier steps acquired stays in the ledger until shutdown.
    pub fn initialize(
        backend: Arc<B>,
        queue_family: u32,
        targets: RenderTargets,
        scene: SceneDescription,
        config: RenderConfig,
    ) -> Self {
        let mut renderer = Self {
            backend,
            config,
            ledger: ResourceLedger::new(),
            synchronizer: None,
            targets,
            objects: Vec::new(),
            ready: false,
            setup_error: None,
        };

        match renderer.run_setup(queue_family, scene) {
            Ok(()) => {
                log::info!(
                    "Renderer ready with {} objects ({} ledger entries)",
                    renderer.objects.len(),
                    renderer.ledger.len(),
                );
                renderer.ready = true;
            }
            Err(err) => {
                log::error!("Renderer setup failed: {}", err);
                renderer.setup_error = Some(err);
            }
        }
        renderer
    }

    fn run_setup(&mut self, queue_family: u32, scene: SceneDescription) -> Result<(), RenderError> {
        let mut sequencer = SetupSequencer::new(&self.backend, &mut self.ledger);
        let state = sequencer.create_frame_primitives(queue_family)?;
        let compiled = sequencer.create_pipelines(&self.targets.pass, &scene)?;
        let uploaded = sequencer.upload_meshes(&scene.meshes)?;

        self.synchronizer = Some(FrameSynchronizer::new(state, &self.config));
        self.objects = scene
            .objects
            .into_iter()
            .map(|object| RenderObject::resolve(object, &compiled, &uploaded))
            .collect();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Why setup stopped, if it did
    pub fn setup_error(&self) -> Option<&RenderError> {
        self.setup_error.as_ref()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn frame_number(&self) -> u64 {
        self.synchronizer
            .as_ref()
            .map_or(0, FrameSynchronizer::frame_number)
    }

    /// Runs one frame cycle
    pub fn draw<S: DisplaySurface + ?Sized>(&mut self, surface: &S) -> FrameOutcome {
        if !self.ready {
            return FrameOutcome::Skipped(SkipReason::NotReady);
        }
        let Some(synchronizer) = self.synchronizer.as_mut() else {
            return FrameOutcome::Skipped(SkipReason::NotReady);
        };

        let config = &self.config;
        let objects = &self.objects;
        synchronizer.run_cycle(self.backend.as_ref(), surface, &self.targets, |frame_number, extent| {
            FramePlan {
                clear_color: config.clear_color_at(frame_number),
                draws: objects
                    .iter()
                    .map(|object| object.draw_call(frame_number, extent))
                    .collect(),
            }
        })
    }

    /// Switches every object with several pipelines to its next one
    pub fn cycle_variant(&mut self) {
        for object in self.objects.iter_mut().filter(|object| object.variants.len() > 1) {
            object.active = (object.active + 1) % object.variants.len();
            log::info!("Switched object to pipeline variant {}", object.active);
        }
    }

    /// Waits for the device to go idle, then releases everything in reverse order.
    ///
    /// Calling it again does nothing.
    pub fn shutdown(&mut self) {
        self.ready = false;
        if self.ledger.is_empty() {
            return;
        }

        if let Err(status) = self.backend.wait_idle() {
            log::error!("Failed to wait for device idle before teardown: {}", status);
        }
        log::info!("Releasing {} ledger entries", self.ledger.len());
        self.ledger.flush();
    }
}

impl<B: RenderBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
