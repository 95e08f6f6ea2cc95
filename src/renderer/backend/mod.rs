//! The driver calls the renderer makes, behind one trait.
//!
//! [`VulkanBackend`](vulkan::VulkanBackend) forwards them to `ash`. Handles are plain
//! `vk` handles, so teardown actions can capture them by value.

pub mod vulkan;

use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::frame::{FrameRecording, Submission};
use crate::renderer::pipeline::{PipelineLayoutDescriptor, RenderPassTarget, ResolvedPipeline};

pub trait RenderBackend: 'static {
    /// Creates a pool whose command buffers can be reset individually
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    /// Also frees every command buffer allocated from the pool
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        pipeline: &ResolvedPipeline<'_>,
        target: &RenderPassTarget,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Creates a host-visible vertex buffer holding `data`
    fn create_vertex_buffer(&self, data: &[u8]) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Returns the image index and whether the swapchain is suboptimal
    fn acquire_next_image(&self, signal: vk::Semaphore, timeout_ns: u64) -> VkResult<(u32, bool)>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    /// Begins, records and ends `command_buffer` for one frame
    fn record_frame(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameRecording<'_>,
    ) -> VkResult<()>;
    fn submit(&self, submission: &Submission) -> VkResult<()>;
    /// Returns whether the swapchain is suboptimal
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
    fn wait_idle(&self) -> VkResult<()>;
}

/// What the renderer needs to know about the window it presents to
pub trait DisplaySurface {
    fn extent(&self) -> vk::Extent2D;

    fn is_minimized(&self) -> bool {
        false
    }

    /// A minimized or zero-area surface cannot be rendered to
    fn is_unrenderable(&self) -> bool {
        let extent = self.extent();
        self.is_minimized() || extent.width == 0 || extent.height == 0
    }
}

/// A surface with a fixed extent, for headless use
impl DisplaySurface for vk::Extent2D {
    fn extent(&self) -> vk::Extent2D {
        *self
    }
}
