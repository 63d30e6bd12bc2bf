use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use fluid_backdrop::config::HostSettings;
use fluid_backdrop::{
    BackendError, Capture, ConfigError, Contact, FluidConfig, FluidSimulator, FrameScheduler, FrameToken,
    GpuBackend, InputEvent, Quality, SurfaceMetrics,
};
use log::{error, info, warn};
use rand::Rng;
use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, TouchPhase, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

/// Winit can't take back a redraw request, so cancelled tokens simply go
/// stale and the simulator ignores them.
struct WinitScheduler {
    window: Arc<Window>,
    next: u64,
}

impl FrameScheduler for WinitScheduler {
    fn request_frame(&mut self) -> FrameToken {
        self.next += 1;
        self.window.request_redraw();
        FrameToken(self.next)
    }

    fn cancel_frame(&mut self, _token: FrameToken) {}
}

fn load_settings(path: &Path) -> HostSettings {
    match HostSettings::load_from_disk(path) {
        Ok(settings) => {
            info!("Loaded settings from {}", path.display());
            settings
        }
        Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => HostSettings::default(),
        Err(err) => {
            warn!("Ignoring {}: {err}", path.display());
            HostSettings::default()
        }
    }
}

fn save_capture(capture: Capture) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(format!(
        "fluid_{}.png",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let image = image::RgbaImage::from_raw(capture.width, capture.height, capture.pixels)
        .context("capture buffer does not match its dimensions")?;
    image.save(&path)?;
    Ok(path)
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let settings_path = HostSettings::default_path();
    let mut settings = load_settings(&settings_path);
    let config = settings.fluid_config().unwrap_or_else(|err| {
        warn!("Invalid simulation settings, using defaults: {err}");
        FluidConfig::default()
    });

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title("Fluid Backdrop")
                .with_inner_size(winit::dpi::LogicalSize::new(1280, 720)),
        )?,
    );

    let backend = pollster::block_on(GpuBackend::new(window.clone()));
    let scheduler = WinitScheduler {
        window: window.clone(),
        next: 0,
    };
    let mut simulator = FluidSimulator::new_or_inert(backend, config, Box::new(scheduler));
    simulator.start(Instant::now());

    let interaction = settings.interaction;
    let mut cursor = (0.0f32, 0.0f32);
    // Set by the keyboard toggle; focus changes never override it.
    let mut user_paused = simulator.config().paused;

    event_loop.run(move |event, target| match event {
        Event::WindowEvent { event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested => {
                simulator.destroy();
                if let Err(err) = settings.save_to_disk(&settings_path) {
                    warn!("Failed to save settings: {err}");
                }
                target.exit();
            }
            WindowEvent::Resized(_) => window.request_redraw(),
            WindowEvent::Focused(focused) => {
                if !user_paused {
                    simulator.set_paused(!focused);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key,
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match physical_key {
                PhysicalKey::Code(KeyCode::Space) => {
                    simulator.queue_random_splats(rand::thread_rng().gen_range(5..=24));
                }
                PhysicalKey::Code(KeyCode::Pause) => {
                    user_paused = !user_paused;
                    simulator.set_paused(user_paused);
                }
                PhysicalKey::Code(KeyCode::KeyP) => match simulator.capture() {
                    Ok(capture) => match save_capture(capture) {
                        Ok(path) => info!("Saved capture to {}", path.display()),
                        Err(err) => error!("Failed to save capture: {err:#}"),
                    },
                    Err(err) => error!("Capture failed: {err}"),
                },
                PhysicalKey::Code(code @ (KeyCode::Digit1 | KeyCode::Digit2 | KeyCode::Digit3)) => {
                    let quality = match code {
                        KeyCode::Digit1 => Quality::Low,
                        KeyCode::Digit2 => Quality::Medium,
                        _ => Quality::High,
                    };
                    match simulator.set_quality(quality) {
                        Ok(()) => settings.quality = Some(quality),
                        Err(err) => error!("Failed to apply {quality:?} quality: {err}"),
                    }
                }
                PhysicalKey::Code(KeyCode::Escape) => {
                    simulator.destroy();
                    if let Err(err) = settings.save_to_disk(&settings_path) {
                        warn!("Failed to save settings: {err}");
                    }
                    target.exit();
                }
                _ => {}
            },
            WindowEvent::CursorMoved { position, .. } => {
                cursor = (position.x as f32, position.y as f32);
                if interaction {
                    simulator.push_input(InputEvent::Move {
                        contact: Contact::Mouse,
                        x: cursor.0,
                        y: cursor.1,
                    });
                }
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } if interaction => {
                let event = match state {
                    ElementState::Pressed => InputEvent::Press {
                        contact: Contact::Mouse,
                        x: cursor.0,
                        y: cursor.1,
                    },
                    ElementState::Released => InputEvent::Release {
                        contact: Contact::Mouse,
                    },
                };
                simulator.push_input(event);
            }
            WindowEvent::Touch(touch) if interaction => {
                let contact = Contact::Touch(touch.id);
                let (x, y) = (touch.location.x as f32, touch.location.y as f32);
                let event = match touch.phase {
                    TouchPhase::Started => InputEvent::Press { contact, x, y },
                    TouchPhase::Moved => InputEvent::Move { contact, x, y },
                    TouchPhase::Ended | TouchPhase::Cancelled => InputEvent::Release { contact },
                };
                simulator.push_input(event);
            }
            WindowEvent::RedrawRequested => {
                let Some(token) = simulator.pending_frame() else {
                    return;
                };
                let size = window.inner_size();
                let metrics = SurfaceMetrics::physical(size.width, size.height);
                match simulator.on_frame(token, Instant::now(), metrics) {
                    Ok(()) => {}
                    Err(BackendError::Surface(msg)) => {
                        error!("Surface unusable, shutting down: {msg}");
                        simulator.destroy();
                        target.exit();
                    }
                    Err(err) => error!("Frame failed: {err}"),
                }
            }
            _ => {}
        },
        _ => {}
    })?;
    Ok(())
}
