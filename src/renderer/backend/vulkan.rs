use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use crate::renderer::backend::RenderBackend;
use crate::renderer::error::RenderError;
use crate::renderer::frame::{FrameRecording, Submission};
use crate::renderer::pipeline::{PipelineLayoutDescriptor, RenderPassTarget, ResolvedPipeline};

/// Issues the renderer's driver calls on one logical device, graphics queue and swapchain.
///
/// The device, queue and swapchain belong to whoever created them and must outlive this
/// backend. Memory for vertex buffers comes from the backend's own allocator.
pub struct VulkanBackend {
    device: ash::Device,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    swapchain_loader: ash::khr::swapchain::Device,

    memory_allocator: Mutex<Allocator>,
    allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
}

impl VulkanBackend {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        swapchain_loader: ash::khr::swapchain::Device,
    ) -> Result<Self, RenderError> {
        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: true,
                log_frees: true,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|err| {
            log::error!("Failed to create memory allocator: {}", err);
            RenderError::AcquisitionFailure {
                resource: "memory allocator",
                status: vk::Result::ERROR_INITIALIZATION_FAILED,
            }
        })?;

        Ok(Self {
            device,
            queue,
            swapchain,
            swapchain_loader,
            memory_allocator: Mutex::new(memory_allocator),
            allocations: Mutex::new(HashMap::new()),
        })
    }

    fn allocate_and_fill(&self, buffer: vk::Buffer, data: &[u8]) -> VkResult<Allocation> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut allocator = self
            .memory_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut allocation = allocator
            .allocate(&AllocationCreateDesc {
                name: "vertex buffer",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| {
                log::error!("Failed to allocate {} bytes of vertex memory: {}", data.len(), err);
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            })?;

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        // CpuToGpu allocations are persistently mapped
        let copied = bound.and_then(|()| {
            presser::copy_from_slice_to_offset(data, &mut allocation, 0)
                .map(|_| ())
                .map_err(|err| {
                    log::error!("Failed to copy vertex data: {:?}", err);
                    vk::Result::ERROR_MEMORY_MAP_FAILED
                })
        });

        match copied {
            Ok(()) => Ok(allocation),
            Err(status) => {
                if let Err(err) = allocator.free(allocation) {
                    log::error!("Failed to free vertex memory: {}", err);
                }
                Err(status)
            }
        }
    }
}

impl RenderBackend for VulkanBackend {
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let command_buffers = unsafe {
            self.device.allocate_command_buffers(&command_buffer_info)?
        };
        command_buffers
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.destroy_semaphore(semaphore, None);
        }
    }

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> VkResult<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&descriptor.set_layouts)
            .push_constant_ranges(&descriptor.push_constant_ranges);
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    fn create_graphics_pipeline(
        &self,
        pipeline: &ResolvedPipeline<'_>,
        target: &RenderPassTarget,
    ) -> VkResult<vk::Pipeline> {
        let desc = pipeline.descriptor;

        let shader_stages = pipeline
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.kind.flags())
                    .module(stage.module)
                    .name(&stage.entry)
            })
            .collect::<Vec<_>>();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&pipeline.vertex_input.bindings)
            .vertex_attribute_descriptions(&pipeline.vertex_input.attributes)
            .flags(pipeline.vertex_input.flags);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are baked into the pipeline
        let viewports = [desc.viewport];
        let scissors = [desc.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            // Discards all primitives before rasterization stage if true
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.rasterization.polygon_mode)
            .line_width(desc.rasterization.line_width)
            .cull_mode(desc.rasterization.cull_mode)
            .front_face(desc.rasterization.front_face)
            // No depth bias
            .depth_bias_enable(false)
            .depth_bias_constant_factor(0.0)
            .depth_bias_clamp(0.0)
            .depth_bias_slope_factor(0.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.multisample.samples)
            .sample_shading_enable(desc.multisample.sample_shading)
            .min_sample_shading(desc.multisample.min_sample_shading)
            .alpha_to_coverage_enable(false)
            .alpha_to_one_enable(false);

        // Attachments must match the fragment shader outputs
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&desc.color_blend_attachments);

        let depth_stencil = desc.depth_stencil.map(|state| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(state.depth_test)
                .depth_write_enable(state.depth_write)
                .depth_compare_op(state.compare_op)
                .depth_bounds_test_enable(false)
                .min_depth_bounds(0.0)
                .max_depth_bounds(1.0)
                .stencil_test_enable(false)
        });

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .layout(pipeline.layout)
            .render_pass(target.render_pass)
            .subpass(0);
        if let Some(depth_stencil) = depth_stencil.as_ref() {
            pipeline_info = pipeline_info.depth_stencil_state(depth_stencil);
        }

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, status)| status)?
        };
        pipelines.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
        }
    }

    fn create_vertex_buffer(&self, data: &[u8]) -> VkResult<vk::Buffer> {
        if data.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(data.len() as u64)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        match self.allocate_and_fill(buffer, data) {
            Ok(allocation) => {
                self.allocations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(buffer, allocation);
                Ok(buffer)
            }
            Err(status) => {
                unsafe {
                    self.device.destroy_buffer(buffer, None);
                }
                Err(status)
            }
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
        let allocation = self
            .allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer);
        if let Some(allocation) = allocation {
            let freed = self
                .memory_allocator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free(allocation);
            if let Err(err) = freed {
                log::error!("Failed to free memory of buffer {:?}: {}", buffer, err);
            }
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&self, signal: vk::Semaphore, timeout_ns: u64) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                signal,
                vk::Fence::null(),
            )
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn record_frame(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameRecording<'_>,
    ) -> VkResult<()> {
        // The command buffer is re-recorded every frame
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.begin_command_buffer(command_buffer, &begin_info)?;
        }

        let mut clear_values = vec![
            vk::ClearValue {
                color: vk::ClearColorValue { float32: frame.clear_color },
            };
            frame.target.color_attachment_count as usize
        ];
        if frame.target.has_depth_attachment {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(frame.target.render_pass)
            .framebuffer(frame.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: frame.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );

            for draw in frame.draws {
                self.device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    draw.pipeline.pipeline,
                );
                if let Some(vertex_buffer) = draw.vertex_buffer {
                    self.device
                        .cmd_bind_vertex_buffers(command_buffer, 0, &[vertex_buffer], &[0]);
                }
                if let Some(push_constants) = draw.push_constants.as_ref() {
                    self.device.cmd_push_constants(
                        command_buffer,
                        draw.pipeline.layout,
                        push_constants.stages,
                        0,
                        &push_constants.bytes,
                    );
                }
                self.device.cmd_draw(command_buffer, draw.vertex_count, 1, 0, 0);
            }

            self.device.cmd_end_render_pass(command_buffer);
            self.device.end_command_buffer(command_buffer)
        }
    }

    fn submit(&self, submission: &Submission) -> VkResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        // A null command buffer submits an empty batch that only moves the semaphores
        let command_buffers: &[vk::CommandBuffer] = if submission.command_buffer.is_null() {
            &[]
        } else {
            std::slice::from_ref(&submission.command_buffer)
        };
        let signal_semaphores = [submission.signal_semaphore];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], submission.fence)
        }
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let wait_semaphores = [wait];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices);
        unsafe {
            self.swapchain_loader
                .queue_present(self.queue, &present_info)
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let allocations = self
            .allocations
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect::<Vec<_>>();
        if allocations.is_empty() {
            return;
        }

        log::warn!("Dropping VulkanBackend with {} live buffers", allocations.len());
        let allocator = self
            .memory_allocator
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (buffer, allocation) in allocations {
            unsafe {
                self.device.destroy_buffer(buffer, None);
            }
            if let Err(err) = allocator.free(allocation) {
                log::error!("Failed to free memory of buffer {:?}: {}", buffer, err);
            }
        }
    }
}
