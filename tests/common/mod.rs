#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::{Mutex, MutexGuard};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use ember::renderer::backend::RenderBackend;
use ember::renderer::frame::{DrawCall, FrameRecording, RenderTargets, Submission};
use ember::renderer::pipeline::{
    PipelineDescriptor, PipelineLayoutDescriptor, PipelineVariant, RenderPassTarget,
    ResolvedPipeline, ShaderStageKind,
};
use ember::renderer::scene::{MeshRequest, ObjectRequest, SceneDescription};
use ember::renderer::shader_data::MeshPushConstants;
use ember::renderer::vertex::Vertex;

pub const IMAGE_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateCommandPool,
    AllocateCommandBuffer,
    DestroyCommandPool,
    CreateFence,
    DestroyFence,
    CreateSemaphore,
    DestroySemaphore,
    CreatePipelineLayout,
    DestroyPipelineLayout,
    CreateGraphicsPipeline,
    DestroyPipeline,
    CreateVertexBuffer,
    DestroyBuffer,
    WaitForFence,
    ResetFence,
    AcquireNextImage,
    ResetCommandBuffer,
    RecordFrame,
    Submit,
    Present,
    WaitIdle,
}

impl Op {
    pub fn is_destroy(self) -> bool {
        matches!(
            self,
            Op::DestroyCommandPool
                | Op::DestroyFence
                | Op::DestroySemaphore
                | Op::DestroyPipelineLayout
                | Op::DestroyPipeline
                | Op::DestroyBuffer
        )
    }
}

/// One driver call. `handle` is the handle created, destroyed or used, 0 if none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub handle: u64,
}

#[derive(Debug, Clone)]
pub struct CompiledRecord {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub stages: Vec<(ShaderStageKind, vk::ShaderModule)>,
    pub attribute_count: usize,
    pub topology: vk::PrimitiveTopology,
    pub entries: Vec<CString>,
    pub cull_mode: vk::CullModeFlags,
    pub scissor: vk::Extent2D,
    pub depth_test: bool,
}

#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub command_buffer: vk::CommandBuffer,
    pub framebuffer: vk::Framebuffer,
    pub clear_color: [f32; 4],
    pub draws: Vec<DrawCall>,
}

struct Failure {
    op: Op,
    skip: usize,
    times: Option<usize>,
    status: vk::Result,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    next_handle: u64,
    live: HashSet<u64>,
    pool_buffers: HashMap<u64, Vec<u64>>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    failures: Vec<Failure>,
    acquire_results: Vec<VkResult<(u32, bool)>>,
    present_results: Vec<VkResult<bool>>,
    next_image: u32,
    null_pipelines: bool,
    compiled: Vec<CompiledRecord>,
    recordings: Vec<RecordedFrame>,
    submissions: Vec<Submission>,
    uploads: Vec<Vec<u8>>,
    violations: Vec<String>,
}

impl Inner {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Signals `semaphore`, which must not already be signaled
    fn signal(&mut self, semaphore: vk::Semaphore, by: Op) {
        let raw = semaphore.as_raw();
        if self.semaphores.insert(raw, true) == Some(true) {
            self.violations.push(format!("{:?} signaled already signaled semaphore {}", by, raw));
        }
    }

    /// Consumes the signal of `semaphore`, which must be signaled
    fn consume(&mut self, semaphore: vk::Semaphore, by: Op) {
        let raw = semaphore.as_raw();
        if self.semaphores.insert(raw, false) != Some(true) {
            self.violations.push(format!("{:?} waited on unsignaled semaphore {}", by, raw));
        }
    }

    fn take_failure(&mut self, op: Op) -> Option<vk::Result> {
        let failure = self.failures.iter_mut().find(|failure| failure.op == op)?;
        if failure.skip > 0 {
            failure.skip -= 1;
            return None;
        }
        let status = failure.status;
        if let Some(times) = failure.times.as_mut() {
            *times -= 1;
            if *times == 0 {
                self.failures.retain(|failure| failure.op != op || failure.times != Some(0));
            }
        }
        Some(status)
    }
}

/// A `RenderBackend` that records every call and simulates a GPU which finishes submitted
/// work instantly.
///
/// Fences track their signaled state: waiting on an unsignaled fence returns `TIMEOUT`,
/// submitting with an already signaled fence is a violation, and a submission signals
/// its fence.
///
/// Semaphores are modelled the same way: acquiring signals one, submitting waits on one and
/// signals another, presenting waits on one. Signaling a signaled semaphore or waiting on an
/// unsignaled one is a violation.
pub struct RecordingBackend {
    inner: Mutex<Inner>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_handle: 1000,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Every future call of `op` fails with `status`
    pub fn fail(&self, op: Op, status: vk::Result) {
        self.lock().failures.push(Failure { op, skip: 0, times: None, status });
    }

    /// The next call of `op` fails with `status`
    pub fn fail_once(&self, op: Op, status: vk::Result) {
        self.fail_nth(op, 0, status);
    }

    /// The call of `op` after `skip` successful ones fails with `status`
    pub fn fail_nth(&self, op: Op, skip: usize, status: vk::Result) {
        self.lock().failures.push(Failure { op, skip, times: Some(1), status });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Results returned by the next acquisitions, in order
    pub fn queue_acquire_results(&self, results: impl IntoIterator<Item = VkResult<(u32, bool)>>) {
        self.lock().acquire_results.extend(results);
    }

    pub fn queue_present_results(&self, results: impl IntoIterator<Item = VkResult<bool>>) {
        self.lock().present_results.extend(results);
    }

    /// The driver reports success but returns null pipelines
    pub fn return_null_pipelines(&self) {
        self.lock().null_pipelines = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().calls.iter().map(|call| call.op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|call| call.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Handles created and not yet destroyed
    pub fn live_handles(&self) -> HashSet<u64> {
        self.lock().live.clone()
    }

    pub fn created(&self, op: Op) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op == op && call.handle != 0)
            .map(|call| call.handle)
            .collect()
    }

    pub fn destroyed(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op.is_destroy())
            .map(|call| call.handle)
            .collect()
    }

    pub fn compiled(&self) -> Vec<CompiledRecord> {
        self.lock().compiled.clone()
    }

    pub fn recordings(&self) -> Vec<RecordedFrame> {
        self.lock().recordings.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.lock().uploads.clone()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.lock().fences.get(&fence.as_raw()).copied()
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> Option<bool> {
        self.lock().semaphores.get(&semaphore.as_raw()).copied()
    }

    /// Misuse the simulated driver detected
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    fn create(&self, op: Op) -> VkResult<u64> {
        let mut inner = self.lock();
        if let Some(status) = inner.take_failure(op) {
            inner.calls.push(Call { op, handle: 0 });
            return Err(status);
        }
        let handle = inner.mint();
        inner.live.insert(handle);
        inner.calls.push(Call { op, handle });
        Ok(handle)
    }

    fn destroy(&self, op: Op, handle: u64) {
        let mut inner = self.lock();
        inner.calls.push(Call { op, handle });
        if !inner.live.remove(&handle) {
            inner.violations.push(format!("{:?} of unknown or released handle {}", op, handle));
        }
    }

    fn call(&self, op: Op, handle: u64) -> VkResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(Call { op, handle });
        match inner.take_failure(op) {
            Some(status) => Err(status),
            None => Ok(inner),
        }
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for RecordingBackend {
    fn create_command_pool(&self, _queue_family: u32) -> VkResult<vk::CommandPool> {
        self.create(Op::CreateCommandPool).map(vk::CommandPool::from_raw)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let handle = self.create(Op::AllocateCommandBuffer)?;
        self.lock()
            .pool_buffers
            .entry(pool.as_raw())
            .or_default()
            .push(handle);
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy(Op::DestroyCommandPool, pool.as_raw());
        let mut inner = self.lock();
        for buffer in inner.pool_buffers.remove(&pool.as_raw()).unwrap_or_default() {
            inner.live.remove(&buffer);
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let handle = self.create(Op::CreateFence)?;
        self.lock().fences.insert(handle, signaled);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.destroy(Op::DestroyFence, fence.as_raw());
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let handle = self.create(Op::CreateSemaphore)?;
        self.lock().semaphores.insert(handle, false);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy(Op::DestroySemaphore, semaphore.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _descriptor: &PipelineLayoutDescriptor,
    ) -> VkResult<vk::PipelineLayout> {
        self.create(Op::CreatePipelineLayout).map(vk::PipelineLayout::from_raw)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy(Op::DestroyPipelineLayout, layout.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        pipeline: &ResolvedPipeline<'_>,
        _target: &RenderPassTarget,
    ) -> VkResult<vk::Pipeline> {
        if self.lock().null_pipelines {
            self.lock().calls.push(Call { op: Op::CreateGraphicsPipeline, handle: 0 });
            return Ok(vk::Pipeline::null());
        }

        let handle = self.create(Op::CreateGraphicsPipeline)?;
        let record = CompiledRecord {
            pipeline: vk::Pipeline::from_raw(handle),
            layout: pipeline.layout,
            stages: pipeline
                .stages
                .iter()
                .map(|stage| (stage.kind, stage.module))
                .collect(),
            attribute_count: pipeline.vertex_input.attributes.len(),
            topology: pipeline.descriptor.topology,
            entries: pipeline.stages.iter().map(|stage| stage.entry.clone()).collect(),
            cull_mode: pipeline.descriptor.rasterization.cull_mode,
            scissor: pipeline.descriptor.scissor.extent,
            depth_test: pipeline.descriptor.depth_stencil.is_some(),
        };
        self.lock().compiled.push(record);
        Ok(vk::Pipeline::from_raw(handle))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy(Op::DestroyPipeline, pipeline.as_raw());
    }

    fn create_vertex_buffer(&self, data: &[u8]) -> VkResult<vk::Buffer> {
        let handle = self.create(Op::CreateVertexBuffer)?;
        self.lock().uploads.push(data.to_vec());
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.destroy(Op::DestroyBuffer, buffer.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut inner = self.call(Op::WaitForFence, fence.as_raw())?;
        match inner.fences.get(&fence.as_raw()).copied() {
            Some(true) => Ok(()),
            Some(false) => {
                // Nothing will ever signal it
                inner.violations.push(format!("waited on unsignaled fence {}", fence.as_raw()));
                Err(vk::Result::TIMEOUT)
            }
            None => {
                inner.violations.push(format!("waited on unknown fence {}", fence.as_raw()));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut inner = self.call(Op::ResetFence, fence.as_raw())?;
        inner.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn acquire_next_image(&self, signal: vk::Semaphore, _timeout_ns: u64) -> VkResult<(u32, bool)> {
        let mut inner = self.call(Op::AcquireNextImage, signal.as_raw())?;
        let result = if inner.acquire_results.is_empty() {
            let index = inner.next_image;
            inner.next_image = (index + 1) % IMAGE_COUNT;
            Ok((index, false))
        } else {
            inner.acquire_results.remove(0)
        };
        if result.is_ok() {
            inner.signal(signal, Op::AcquireNextImage);
        }
        result
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.call(Op::ResetCommandBuffer, command_buffer.as_raw()).map(|_| ())
    }

    fn record_frame(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameRecording<'_>,
    ) -> VkResult<()> {
        let mut inner = self.call(Op::RecordFrame, command_buffer.as_raw())?;
        inner.recordings.push(RecordedFrame {
            command_buffer,
            framebuffer: frame.framebuffer,
            clear_color: frame.clear_color,
            draws: frame.draws.to_vec(),
        });
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> VkResult<()> {
        let mut inner = self.call(Op::Submit, submission.fence.as_raw())?;
        let fence = submission.fence.as_raw();
        if inner.fences.get(&fence).copied().unwrap_or(false) {
            inner.violations.push(format!("submitted with signaled fence {}", fence));
        }
        inner.fences.insert(fence, true);
        inner.consume(submission.wait_semaphore, Op::Submit);
        inner.signal(submission.signal_semaphore, Op::Submit);
        inner.submissions.push(*submission);
        Ok(())
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        // A queued present consumes its semaphore even when it reports an error
        let mut inner = self.lock();
        inner.calls.push(Call { op: Op::Present, handle: u64::from(image_index) });
        inner.consume(wait, Op::Present);
        if let Some(status) = inner.take_failure(Op::Present) {
            return Err(status);
        }
        if !inner.present_results.is_empty() {
            return inner.present_results.remove(0);
        }
        Ok(false)
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.call(Op::WaitIdle, 0).map(|_| ())
    }
}

pub fn extent() -> vk::Extent2D {
    vk::Extent2D { width: 1700, height: 900 }
}

pub fn render_pass_target() -> RenderPassTarget {
    RenderPassTarget {
        render_pass: vk::RenderPass::from_raw(9000),
        color_attachment_count: 1,
        has_depth_attachment: false,
    }
}

pub fn render_targets() -> RenderTargets {
    RenderTargets {
        pass: render_pass_target(),
        framebuffers: (0..IMAGE_COUNT as u64)
            .map(|i| vk::Framebuffer::from_raw(9100 + i))
            .collect(),
        extent: extent(),
    }
}

pub fn module(raw: u64) -> vk::ShaderModule {
    vk::ShaderModule::from_raw(raw)
}

pub fn triangle_vertices() -> Vec<Vertex> {
    vec![Vertex::default(); 3]
}

/// Two switchable triangle pipelines and a push-constant mesh pipeline
pub fn demo_scene() -> SceneDescription {
    SceneDescription::new(PipelineDescriptor::new(extent()))
        .with_layout(PipelineLayoutDescriptor::new())
        .with_layout(
            PipelineLayoutDescriptor::new()
                .with_push_constants(vk::ShaderStageFlags::VERTEX, MeshPushConstants::SIZE),
        )
        .with_pipeline("red", 0, PipelineVariant::from_modules(module(1), module(2)))
        .with_pipeline("colored", 0, PipelineVariant::from_modules(module(3), module(4)))
        .with_pipeline(
            "mesh",
            1,
            PipelineVariant::from_modules(module(5), module(4))
                .with_vertex_input(Vertex::input_description()),
        )
        .with_mesh(MeshRequest::from_vertices("triangle", &triangle_vertices()))
        .with_object(ObjectRequest::new(&["red", "colored"], 3))
        .with_object(
            ObjectRequest::new(&["mesh"], 0)
                .with_mesh("triangle")
                .with_push_constants(vk::ShaderStageFlags::VERTEX, |frame_number, _extent| {
                    frame_number.to_ne_bytes().to_vec()
                }),
        )
}
