use std::ffi::{c_char, c_void, CStr};
use std::path::Path;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;
use ember::renderer::config::RenderConfig;
use ember::renderer::frame::RenderTargets;
use ember::renderer::ledger::ResourceLedger;
use ember::renderer::pipeline::RenderPassTarget;

const SHADERS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders-built");

/// Everything the renderer runs on: instance, device, swapchain and the render pass that
/// draws into it.
///
/// Torn down in reverse creation order when dropped, so it must outlive every
/// `VulkanBackend` and `Renderer` built on its device.
pub struct VulkanContext {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue_family: u32,
    pub graphics_queue: vk::Queue,

    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,

    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    ledger: ResourceLedger,
}

impl VulkanContext {
    const ENABLE_VALIDATION_LAYERS: bool = cfg!(debug_assertions);
    const VALIDATION_LAYER: &'static CStr = c"VK_LAYER_KHRONOS_validation";

    pub fn new(window: &Window, config: &RenderConfig) -> Result<Self> {
        let mut ledger = ResourceLedger::new();

        let entry = unsafe { ash::Entry::load()? };

        let validation = Self::ENABLE_VALIDATION_LAYERS && Self::validation_layer_supported(&entry)?;
        let instance = Self::create_instance(&entry, window, validation)?;
        {
            let instance = instance.clone();
            ledger.register("instance", move || unsafe { instance.destroy_instance(None) });
        }

        if validation {
            let debug_utils_loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = unsafe {
                debug_utils_loader
                    .create_debug_utils_messenger(&debug_utils_messenger_create_info(), None)?
            };
            ledger.register("debug messenger", move || unsafe {
                debug_utils_loader.destroy_debug_utils_messenger(messenger, None)
            });
        }

        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )?
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        {
            let surface_loader = surface_loader.clone();
            ledger.register("surface", move || unsafe {
                surface_loader.destroy_surface(surface, None)
            });
        }

        let (physical_device, graphics_queue_family) =
            Self::select_physical_device(&instance, surface, &surface_loader)?;
        let device = Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;
        {
            let device = device.clone();
            ledger.register("device", move || unsafe { device.destroy_device(None) });
        }
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let (swapchain, surface_format, extent) = Self::create_swapchain(
            surface,
            &surface_loader,
            physical_device,
            &swapchain_loader,
            window,
            config,
        )?;
        {
            let swapchain_loader = swapchain_loader.clone();
            ledger.register("swapchain", move || unsafe {
                swapchain_loader.destroy_swapchain(swapchain, None)
            });
        }

        let image_views = Self::create_image_views(&device, &swapchain_loader, swapchain, surface_format.format)?;
        for &view in &image_views {
            let device = device.clone();
            ledger.register("swapchain image view", move || unsafe {
                device.destroy_image_view(view, None)
            });
        }

        let render_pass = Self::create_render_pass(&device, surface_format.format)?;
        {
            let device = device.clone();
            ledger.register("render pass", move || unsafe {
                device.destroy_render_pass(render_pass, None)
            });
        }

        let mut framebuffers = Vec::with_capacity(image_views.len());
        for view in &image_views {
            let attachments = [*view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None)? };
            let device = device.clone();
            ledger.register("framebuffer", move || unsafe {
                device.destroy_framebuffer(framebuffer, None)
            });
            framebuffers.push(framebuffer);
        }

        log::info!(
            "Swapchain ready: {} images of {:?} at {}x{}",
            framebuffers.len(),
            surface_format.format,
            extent.width,
            extent.height,
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            graphics_queue_family,
            graphics_queue,
            swapchain,
            swapchain_loader,
            surface_format,
            extent,
            render_pass,
            framebuffers,
            ledger,
        })
    }

    pub fn render_targets(&self) -> RenderTargets {
        RenderTargets {
            pass: RenderPassTarget {
                render_pass: self.render_pass,
                color_attachment_count: 1,
                has_depth_attachment: false,
            },
            framebuffers: self.framebuffers.clone(),
            extent: self.extent,
        }
    }

    /// Loads `shaders-built/<name>.spv`. The module lives as long as the context.
    pub fn load_shader_module(&mut self, name: &str) -> Result<vk::ShaderModule> {
        let path = Path::new(SHADERS_DIR).join(format!("{}.spv", name));
        let mut file = std::fs::File::open(&path)
            .map_err(|err| eyre!("Failed to open shader {:?}: {}", path, err))?;
        let code = ash::util::read_spv(&mut file)?;

        let shader_module_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let shader_module = unsafe { self.device.create_shader_module(&shader_module_info, None)? };

        let device = self.device.clone();
        self.ledger.register("shader module", move || unsafe {
            device.destroy_shader_module(shader_module, None)
        });
        log::debug!("Loaded shader {:?}", path);
        Ok(shader_module)
    }

    fn create_instance(entry: &ash::Entry, window: &Window, validation: bool) -> Result<ash::Instance> {
        let application_info = vk::ApplicationInfo::default()
            .application_name(c"ember")
            .engine_name(c"ember")
            .api_version(vk::API_VERSION_1_1);

        let enabled_layer_names = if validation {
            vec![Self::VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let mut extensions = ash_window::enumerate_required_extensions(
            window.display_handle()?.as_raw(),
        )?
        .to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
        }

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&extensions);
        if validation {
            // Also reports problems with instance creation itself
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info.flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        Ok(unsafe { entry.create_instance(&instance_info, None)? })
    }

    fn validation_layer_supported(entry: &ash::Entry) -> Result<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let supported = layers
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == Self::VALIDATION_LAYER));
        if !supported {
            log::warn!("Validation layer {:?} not available, continuing without it", Self::VALIDATION_LAYER);
        }
        Ok(supported)
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        devices
            .into_iter()
            // Filter out devices without swapchain support
            .filter(|device| {
                let extensions = unsafe { instance.enumerate_device_extension_properties(*device) }
                    .unwrap_or_default();
                extensions
                    .iter()
                    .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == ash::khr::swapchain::NAME))
            })
            // The graphics queue must also be able to present
            .filter_map(|device| {
                let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
                props
                    .iter()
                    .enumerate()
                    .position(|(i, family)| {
                        let supports_present = unsafe {
                            surface_loader.get_physical_device_surface_support(device, i as u32, surface)
                        }
                        .unwrap_or(false);
                        family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && supports_present
                    })
                    .map(|index| (device, index as u32))
            })
            .min_by_key(|(device, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    _ => 4,
                }
            })
            .ok_or_eyre("No suitable physical device found")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)];

        let enabled_extension_names: Vec<*const c_char> = vec![
            ash::khr::swapchain::NAME.as_ptr(),
            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME.as_ptr(),
        ];

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names);

        Ok(unsafe { instance.create_device(physical_device, &device_create_info, None)? })
    }

    fn create_swapchain(
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        swapchain_loader: &ash::khr::swapchain::Device,
        window: &Window,
        config: &RenderConfig,
    ) -> Result<(vk::SwapchainKHR, vk::SurfaceFormatKHR, vk::Extent2D)> {
        let surface_capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let surface_formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let surface_present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        let surface_format = surface_formats
            .iter()
            .find(|format| {
                format.format == vk::Format::B8G8R8A8_SRGB
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| surface_formats.first())
            .copied()
            .ok_or_eyre("No suitable surface format found")?;

        // FIFO is always available and waits for vblank
        let present_mode = if config.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            surface_present_modes
                .iter()
                .copied()
                .find(|mode| *mode == vk::PresentModeKHR::MAILBOX)
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let image_extent = if surface_capabilities.current_extent.width != u32::MAX {
            surface_capabilities.current_extent
        } else {
            let window_size = window.inner_size();
            vk::Extent2D {
                width: window_size.width.clamp(
                    surface_capabilities.min_image_extent.width,
                    surface_capabilities.max_image_extent.width,
                ),
                height: window_size.height.clamp(
                    surface_capabilities.min_image_extent.height,
                    surface_capabilities.max_image_extent.height,
                ),
            }
        };

        let min_image_count = {
            let min = surface_capabilities.min_image_count;
            let max = surface_capabilities.max_image_count;
            // One more than the minimum so acquiring never waits on the driver
            if max > 0 && min + 1 > max { max } else { min + 1 }
        };
        let pre_transform = if surface_capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_capabilities.current_transform
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(image_extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&swapchain_info, None)? };
        log::debug!("Created swapchain with present mode {:?}", present_mode);

        Ok((swapchain, surface_format, image_extent))
    }

    fn create_image_views(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
    ) -> Result<Vec<vk::ImageView>> {
        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };
        let views = images
            .iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::R,
                        g: vk::ComponentSwizzle::G,
                        b: vk::ComponentSwizzle::B,
                        a: vk::ComponentSwizzle::A,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image(*image);
                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<VkResult<Vec<_>>>()?;
        Ok(views)
    }

    fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
        // Cleared on load, handed to the presentation engine when the pass ends
        let color_attachment = vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachment_refs)];

        // The layout transition waits for the acquire semaphore at color output
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let attachments = [color_attachment];
        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        Ok(unsafe { device.create_render_pass(&render_pass_info, None)? })
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            log::error!("Failed to wait for device idle: {}", err);
        }
        self.ledger.flush();
    }
}

fn debug_utils_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let msg = unsafe {
        if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
            c"<no message>"
        } else {
            CStr::from_ptr((*p_callback_data).p_message)
        }
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::trace!("{} {:?}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{} {:?}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{} {:?}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{} {:?}", msg_type, msg),
        _ => log::warn!("{} {:?}", msg_type, msg),
    }

    vk::FALSE
}
