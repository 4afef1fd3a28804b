use std::sync::Arc;

use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use quadfx::{
    AppConfig, DecodedImage, Drawable, EffectDescriptor, EffectRegistry, GpuContext,
    LoggingConfig, init_logging,
};

struct App {
    config: AppConfig,
    image: DecodedImage,
    drawable: Drawable,
    window: Option<Arc<Window>>,
    gpu: Option<GpuContext>,
}

impl App {
    fn new(config: AppConfig, descriptor: EffectDescriptor) -> Self {
        let image = load_image(&config);
        let drawable = Drawable::new(descriptor, config.render.clone());
        Self {
            config,
            image,
            drawable,
            window: None,
            gpu: None,
        }
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };

        match gpu.begin_frame() {
            Ok(()) => {
                let (width, height) = gpu.size();
                self.drawable.draw(gpu, width, height);
                gpu.end_frame();
            }
            Err(wgpu::SurfaceError::Outdated) => {
                if let Some(window) = &self.window {
                    let size = window.inner_size();
                    log::debug!(
                        "surface outdated, reconfiguring at {}x{}",
                        size.width,
                        size.height
                    );
                    gpu.resize(size.width, size.height);
                }
            }
            Err(wgpu::SurfaceError::Lost) => {
                log::warn!("surface lost, rebuilding effect resources");
                gpu.reset();
                self.drawable.context_lost();
                if let Err(err) = self.drawable.prepare(gpu, Some(&self.image)) {
                    log::error!("could not rebuild effect: {err}");
                    event_loop.exit();
                }
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                log::error!("out of GPU memory");
                event_loop.exit();
            }
            Err(err) => log::warn!("skipping frame: {err}"),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("failed to create window: {err}");
                event_loop.exit();
                return;
            }
        };

        let mut gpu = match GpuContext::new(window.clone()) {
            Ok(gpu) => gpu,
            Err(err) => {
                log::error!("failed to initialize GPU: {err}");
                event_loop.exit();
                return;
            }
        };

        if let Err(err) = self.drawable.prepare(&mut gpu, Some(&self.image)) {
            log::error!("failed to prepare '{}': {err}", self.config.effect);
            event_loop.exit();
            return;
        }

        window.request_redraw();
        self.gpu = Some(gpu);
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                if let Some(gpu) = &mut self.gpu {
                    self.drawable.release(gpu);
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(gpu) = &mut self.gpu {
                    gpu.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                self.render(event_loop);
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => (),
        }
    }
}

fn load_image(config: &AppConfig) -> DecodedImage {
    let fallback =
        || DecodedImage::checkerboard(256, 256, 32, [230, 230, 230, 255], [40, 40, 48, 255]);
    match &config.image_path {
        Some(path) => match DecodedImage::open(path) {
            Ok(image) => {
                log::info!("loaded {} ({}x{})", path.display(), image.width, image.height);
                image
            }
            Err(err) => {
                log::warn!("could not load {}: {err}, using a checkerboard", path.display());
                fallback()
            }
        },
        None => fallback(),
    }
}

fn main() {
    init_logging(LoggingConfig::default());

    let config = match AppConfig::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            eprintln!("usage: quadfx [effect] [image]");
            std::process::exit(2);
        }
    };

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            log::error!("failed to create event loop: {err}");
            std::process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let registry = EffectRegistry::builtin();
    let descriptor = match registry.resolve(config.effect.as_str()) {
        Ok(descriptor) => descriptor.clone(),
        Err(err) => {
            log::error!("{err}");
            std::process::exit(2);
        }
    };
    log::info!("running effect '{}' ({})", descriptor.id, descriptor.title);

    let mut app = App::new(config, descriptor);
    if let Err(err) = event_loop.run_app(&mut app) {
        log::error!("event loop terminated: {err}");
    }
}
