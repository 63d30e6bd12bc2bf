//! A grid fluid solver on the GPU that paints animated dye over a window
//! surface and reacts to pointer and touch input.

pub mod backend;
pub mod capabilities;
pub mod clock;
pub mod color;
pub mod config;
pub mod fields;
pub mod pointer;
pub mod programs;
pub mod renderer;
pub mod simulator;
pub mod splat;
pub mod stepper;

pub use backend::{Backend, BackendError, CpuBackend, GpuBackend};
pub use capabilities::{ApiTier, Capabilities, InitError};
pub use config::{BackColor, ColorInput, ConfigError, FluidConfig, Quality};
pub use pointer::{Contact, InputEvent};
pub use simulator::{Capture, FluidSimulator, FrameScheduler, FrameToken, Phase, SurfaceMetrics};
