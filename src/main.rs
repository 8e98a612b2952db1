// =============================================================================
// MIPMAP RENDERER - one textured, mipmapped mesh on Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── FramePacer (frame index, resize / recreate flags)        │
// │          └── Renderer (FrameTarget)                             │
// │                └── Swapchain, FrameSlots, pipeline, descriptors │
// │                      └── Texture + mesh, uploaded at startup    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait on the current slot's fence
// 2. Acquire swapchain image (out of date -> recreate, retry next redraw)
// 3. Reset fence, write uniforms, record command buffer
// 4. Submit, present
// 5. Recreate if stale, suboptimal or resized; advance slot
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod error;
mod renderer;

use anyhow::{Context, Result};
use backend::FramePacer;
use config::Config;
use renderer::Renderer;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, config_error) = Config::load_or_default(CONFIG_PATH);

    init_logging(&config)?;
    log::info!("Starting mipmap renderer");
    if let Some(e) = config_error {
        log::warn!("Failed to load {}: {:#}. Using defaults.", CONFIG_PATH, e);
    }
    log::debug!("Config: {:?}", config);
    log::info!("Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Fatal render errors stop the loop and end up here
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging; RUST_LOG overrides the Info default
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    // Dropped before the window it draws into
    renderer: Option<Renderer>,
    pacer: FramePacer,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let pacer = FramePacer::new(config.graphics.max_frames_in_flight);
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            pacer,
            window: None,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Log the error, keep it for main, and stop the loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:?}", error);
        self.fatal = Some(error);
        // Release GPU objects while the window is still alive
        self.renderer = None;
        event_loop.exit();
    }

    fn render_frame(&mut self) -> Result<bool> {
        match self.renderer.as_mut() {
            Some(renderer) => self.pacer.draw_frame(renderer),
            None => Ok(false),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.pacer.notify_surface_resized();
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };
        self.window = Some(window.clone());

        match Renderer::new(window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    let _ = renderer.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.pacer.notify_surface_resized();
                // Wakes a paused loop once the window is restored
                if let Some(ref window) = self.window {
                    window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws, unless minimized
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.pacer.recreate_pending() {
            return;
        }
        if let Some(ref renderer) = self.renderer {
            renderer.window().request_redraw();
        }
    }
}
