pub mod cpu;
pub mod gpu;

pub use cpu::CpuBackend;
pub use gpu::GpuBackend;


use crate::capabilities::{Capabilities, Channels, InitError};
use crate::programs::{PassUniforms, ProgramDesc, ProgramSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Linear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Field(Channels),
    Rgba8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Field(TargetId),
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blend {
    Replace,
    Additive,
    Premultiplied,
}

#[derive(Debug, Clone, Copy)]
pub struct Pass {
    pub desc: ProgramDesc,
    pub uniforms: PassUniforms,
    pub inputs: [Option<TargetId>; 3],
    pub target: Target,
    pub blend: Blend,
}

impl Pass {
    pub fn new(desc: ProgramDesc, uniforms: PassUniforms, target: Target) -> Self {
        Self {
            desc,
            uniforms,
            inputs: [None; 3],
            target,
            blend: Blend::Replace,
        }
    }

    pub fn input(mut self, slot: usize, id: TargetId) -> Self {
        self.inputs[slot] = Some(id);
        self
    }

    pub fn blend(mut self, blend: Blend) -> Self {
        self.blend = blend;
        self
    }

    /// A pass may never sample the surface it renders into.
    pub fn aliases_output(&self) -> bool {
        match self.target {
            Target::Field(out) => self.inputs.iter().flatten().any(|&id| id == out),
            Target::Screen => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("render target {0:?} does not exist")]
    UnknownTarget(TargetId),
    #[error("pass reads and writes target {0:?}")]
    AliasedPass(TargetId),
    #[error("failed to acquire surface image: {0}")]
    Surface(String),
    #[error("failed to read back target: {0}")]
    Readback(String),
    #[error("cannot read back {0:?} targets")]
    Unreadable(wgpu::TextureFormat),
    #[error("no rendering context is active")]
    Inactive,
}

pub trait Backend {
    fn capabilities(&self) -> &Capabilities;

    fn surface_size(&self) -> (u32, u32);

    fn resize_surface(&mut self, width: u32, height: u32);

    fn prepare(&mut self, _programs: &ProgramSet) -> Result<(), InitError> {
        Ok(())
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError>;

    fn release_target(&mut self, id: TargetId);

    fn draw(&mut self, pass: &Pass) -> Result<(), BackendError>;

    /// Flushes recorded passes and presents the surface image if one was drawn.
    fn submit(&mut self);

    /// Reads a target back as RGBA texels, row 0 first.
    fn read_target(&mut self, id: TargetId) -> Result<Vec<[f32; 4]>, BackendError>;

    fn release_all(&mut self);
}
