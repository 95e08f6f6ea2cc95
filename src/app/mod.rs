mod bootstrap;
mod scene;

use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use ember::renderer::backend::vulkan::VulkanBackend;
use ember::renderer::backend::DisplaySurface;
use ember::renderer::config::RenderConfig;
use ember::renderer::frame::FrameOutcome;
use ember::renderer::Renderer;
use crate::app::bootstrap::VulkanContext;

pub struct AppConfig {
    pub window_title: String,
    pub window_extent: vk::Extent2D,
    pub render: RenderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window_title: "Ember".to_owned(),
            window_extent: vk::Extent2D { width: 1700, height: 900 },
            render: RenderConfig::default(),
        }
    }
}

struct WindowSurface<'a>(&'a Window);

impl DisplaySurface for WindowSurface<'_> {
    fn extent(&self) -> vk::Extent2D {
        let size = self.0.inner_size();
        vk::Extent2D { width: size.width, height: size.height }
    }

    fn is_minimized(&self) -> bool {
        self.0.is_minimized().unwrap_or(false)
    }
}

/// GPU state of the app, dropped field by field in this order
struct Gpu {
    renderer: Renderer<VulkanBackend>,
    // Owns the memory allocator, which must go before the device
    backend: Arc<VulkanBackend>,
    _context: VulkanContext,
}

impl Gpu {
    fn new(window: &Window, config: &RenderConfig) -> Result<Self> {
        let mut context = VulkanContext::new(window, config)?;
        let backend = Arc::new(VulkanBackend::new(
            &context.instance,
            context.physical_device,
            context.device.clone(),
            context.graphics_queue,
            context.swapchain,
            context.swapchain_loader.clone(),
        )?);

        let scene = scene::build_scene(&mut context)?;
        let renderer = Renderer::initialize(
            backend.clone(),
            context.graphics_queue_family,
            context.render_targets(),
            scene,
            config.clone(),
        );
        if let Some(err) = renderer.setup_error() {
            return Err(eyre!("Renderer setup failed: {}", err));
        }

        Ok(Self {
            renderer,
            backend,
            _context: context,
        })
    }

    fn shutdown(&mut self) {
        self.renderer.shutdown();
        log::debug!("Renderer shut down, {} backend references left", Arc::strong_count(&self.backend));
    }
}

pub struct App {
    config: AppConfig,
    window: Option<Arc<Window>>,
    gpu: Option<Gpu>,

    close_requested: bool,
    exit_error: Option<color_eyre::Report>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            window: None,
            gpu: None,
            close_requested: false,
            exit_error: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop.run_app(&mut self)?;

        match self.exit_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: color_eyre::Report) {
        log::error!("{}", err);
        self.exit_error = Some(err);
        self.close_requested = true;
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let attributes = Window::default_attributes()
            .with_title(self.config.window_title.clone())
            .with_inner_size(PhysicalSize::new(
                self.config.window_extent.width,
                self.config.window_extent.height,
            ))
            .with_resizable(false);
        Ok(Arc::new(event_loop.create_window(attributes)?))
    }

    fn draw(&mut self) {
        let (Some(window), Some(gpu)) = (self.window.as_ref(), self.gpu.as_mut()) else {
            return;
        };
        let outcome = gpu.renderer.draw(&WindowSurface(window));
        if let FrameOutcome::Fatal(err) = outcome {
            self.fail(eyre!("Rendering stopped: {}", err));
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            match self.create_window(event_loop) {
                Ok(window) => self.window = Some(window),
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }

        if self.gpu.is_none() {
            if let Some(window) = self.window.clone() {
                match Gpu::new(&window, &self.config.render) {
                    Ok(gpu) => self.gpu = Some(gpu),
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.window.as_ref().is_none_or(|window| window.id() != window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::RedrawRequested => {
                self.draw();
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: key,
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
                ..
            } => match key.as_ref() {
                Key::Named(NamedKey::Space) => {
                    if let Some(gpu) = self.gpu.as_mut() {
                        gpu.renderer.cycle_variant();
                    }
                }
                Key::Named(NamedKey::Escape) => {
                    self.close_requested = true;
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.close_requested {
            event_loop.exit();
            return;
        }

        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut gpu) = self.gpu.take() {
            log::info!("Exiting after {} frames", gpu.renderer.frame_number());
            gpu.shutdown();
        }
    }
}
