use std::time::Instant;

use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{Backend, BackendError, Filter, Target, TargetDesc, TargetFormat};
use crate::capabilities::InitError;
use crate::clock::FrameClock;
use crate::config::{ColorInput, ConfigError, FluidConfig, Quality};
use crate::fields::{fit_resolution, FieldArena, FieldLayout};
use crate::pointer::{InputEvent, InputQueue, PointerTracker};
use crate::programs::ProgramSet;
use crate::renderer::Renderer;
use crate::splat::{SplatInjector, SplatRequest, SplatStack};
use crate::stepper::SimulationStepper;

const INITIAL_SPLATS: std::ops::RangeInclusive<u32> = 5..=24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken(pub u64);

pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameToken;
    fn cancel_frame(&mut self, token: FrameToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Running,
    Paused,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceMetrics {
    pub logical_width: f64,
    pub logical_height: f64,
    pub pixel_ratio: f64,
}

impl SurfaceMetrics {
    pub fn physical(width: u32, height: u32) -> Self {
        Self {
            logical_width: width as f64,
            logical_height: height as f64,
            pixel_ratio: 1.0,
        }
    }

    pub fn physical_size(&self) -> (u32, u32) {
        let ratio = if self.pixel_ratio > 0.0 { self.pixel_ratio } else { 1.0 };
        (
            (self.logical_width * ratio).floor().max(0.0) as u32,
            (self.logical_height * ratio).floor().max(0.0) as u32,
        )
    }
}

/// An RGBA8 still of the composited frame, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

struct Core<B: Backend> {
    backend: B,
    programs: ProgramSet,
    fields: FieldArena,
    pointers: PointerTracker,
    splats: SplatStack,
    surface: (u32, u32),
}

impl<B: Backend> Core<B> {
    fn reallocate(&mut self, config: &FluidConfig) -> Result<(), BackendError> {
        let (width, height) = self.surface;
        let layout = FieldLayout::new(config, width, height);
        self.fields.reallocate(&mut self.backend, &self.programs, &layout)
    }

    fn resize(&mut self, config: &FluidConfig, size: (u32, u32)) -> Result<bool, BackendError> {
        if size == self.surface {
            return Ok(false);
        }
        debug!("Surface resized {:?} -> {:?}", self.surface, size);
        self.surface = size;
        self.backend.resize_surface(size.0, size.1);
        self.reallocate(config)?;
        Ok(true)
    }

    fn apply_inputs<R: Rng + ?Sized>(
        &mut self,
        config: &FluidConfig,
        events: impl Iterator<Item = InputEvent>,
        rng: &mut R,
    ) -> Result<(), BackendError> {
        for event in events {
            self.pointers.apply(event, self.surface, rng);
        }

        let mut injector = SplatInjector::new(&mut self.backend, &self.programs, config);
        if let Some(amount) = self.splats.pop() {
            trace!("Injecting {amount} queued random splats");
            injector.multiple_splats(&mut self.fields, amount, rng)?;
        }
        for pointer in self.pointers.take_moved() {
            injector.splat(&mut self.fields, &SplatRequest::from_pointer(&pointer, config.splat_force))?;
        }
        Ok(())
    }

    fn render(&mut self, config: &FluidConfig, target: Target, size: (u32, u32)) -> Result<(), BackendError> {
        Renderer::new(&mut self.backend, &self.programs, config).render(&self.fields, target, size)
    }
}

pub struct FluidSimulator<B: Backend> {
    phase: Phase,
    config: FluidConfig,
    core: Option<Core<B>>,
    scheduler: Box<dyn FrameScheduler>,
    pending: Option<FrameToken>,
    input: InputQueue,
    clock: FrameClock,
    rng: StdRng,
}

impl<B: Backend> FluidSimulator<B> {
    pub fn new(
        mut backend: B,
        mut config: FluidConfig,
        scheduler: Box<dyn FrameScheduler>,
    ) -> Result<Self, InitError> {
        let mut rng = StdRng::from_entropy();
        let caps = *backend.capabilities();
        if !caps.linear_filtering {
            warn!("Linear filtering unavailable, degrading dye resolution and effects");
            config.degrade_for_missing_linear_filtering();
        }
        config.sanitize();

        let programs = ProgramSet::select(&caps, &config);
        backend.prepare(&programs)?;

        let surface = backend.surface_size();
        let layout = FieldLayout::new(&config, surface.0, surface.1);
        let mut fields =
            FieldArena::allocate(&mut backend, &layout).map_err(|e| InitError::Target(e.to_string()))?;

        let burst = rng.gen_range(INITIAL_SPLATS);
        SplatInjector::new(&mut backend, &programs, &config)
            .multiple_splats(&mut fields, burst, &mut rng)
            .map_err(|e| InitError::Target(e.to_string()))?;
        backend.submit();

        info!(
            "Fluid simulator ready: {:?} tier, surface {}x{}, sim {:?}, dye {:?}",
            caps.tier,
            surface.0,
            surface.1,
            fields.sim_size(),
            fields.dye_size()
        );

        let pointers = PointerTracker::new(&mut rng);
        let phase = if config.paused { Phase::Paused } else { Phase::Running };
        Ok(Self {
            phase,
            config,
            core: Some(Core {
                backend,
                programs,
                fields,
                pointers,
                splats: SplatStack::default(),
                surface,
            }),
            scheduler,
            pending: None,
            input: InputQueue::default(),
            clock: FrameClock::new(Instant::now()),
            rng,
        })
    }

    /// Like [`FluidSimulator::new`], but a failure only gets logged. The
    /// returned instance never draws and ignores every call.
    pub fn new_or_inert(
        backend: Result<B, InitError>,
        config: FluidConfig,
        scheduler: Box<dyn FrameScheduler>,
    ) -> Self {
        match backend.and_then(|backend| Self::new(backend, config.clone(), scheduler)) {
            Ok(simulator) => simulator,
            Err(err) => {
                error!("Fluid backdrop disabled: {err}");
                Self::inert(config)
            }
        }
    }

    fn inert(config: FluidConfig) -> Self {
        Self {
            phase: Phase::Uninitialized,
            config,
            core: None,
            scheduler: Box::new(Unscheduled),
            pending: None,
            input: InputQueue::default(),
            clock: FrameClock::new(Instant::now()),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.core.is_some()
    }

    pub fn pending_frame(&self) -> Option<FrameToken> {
        self.pending
    }

    pub fn backend(&self) -> Option<&B> {
        self.core.as_ref().map(|core| &core.backend)
    }

    pub fn fields(&self) -> Option<&FieldArena> {
        self.core.as_ref().map(|core| &core.fields)
    }

    pub fn start(&mut self, now: Instant) {
        if self.core.is_none() || self.pending.is_some() {
            return;
        }
        self.clock.reset(now);
        self.pending = Some(self.scheduler.request_frame());
        info!("Fluid simulator started");
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.pending.take() {
            self.scheduler.cancel_frame(token);
            info!("Fluid simulator stopped");
        }
    }

    pub fn pause(&mut self) {
        self.set_paused(true);
    }

    pub fn resume(&mut self) {
        self.set_paused(false);
    }

    /// Paused frames still composite; only the solver step is skipped.
    pub fn set_paused(&mut self, paused: bool) {
        if self.core.is_none() {
            return;
        }
        self.config.paused = paused;
        self.phase = if paused { Phase::Paused } else { Phase::Running };
        debug!("Simulation {}", if paused { "paused" } else { "resumed" });
    }

    pub fn destroy(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.stop();
        self.input.detach();
        if let Some(mut core) = self.core.take() {
            core.fields.release(&mut core.backend);
            core.backend.release_all();
        }
        self.phase = Phase::Destroyed;
        info!("Fluid simulator destroyed");
    }

    pub fn set_quality(&mut self, quality: Quality) -> Result<(), BackendError> {
        let Some(core) = self.core.as_mut() else {
            return Err(BackendError::Inactive);
        };
        self.config.apply_quality(quality);
        if !core.backend.capabilities().linear_filtering {
            self.config.degrade_for_missing_linear_filtering();
        }
        info!(
            "Quality {:?}: sim {}, dye {}",
            quality, self.config.sim_resolution, self.config.dye_resolution
        );
        core.reallocate(&self.config)
    }

    pub fn set_background_color(&mut self, color: impl Into<ColorInput>) -> Result<(), ConfigError> {
        self.config.back_color = color.into().resolve()?;
        Ok(())
    }

    pub fn push_input(&mut self, event: InputEvent) -> bool {
        self.input.push(event)
    }

    pub fn queue_random_splats(&mut self, amount: u32) {
        if let Some(core) = self.core.as_mut() {
            core.splats.push(amount);
        }
    }

    pub fn splat(&mut self, request: &SplatRequest) -> Result<(), BackendError> {
        let core = self.core.as_mut().ok_or(BackendError::Inactive)?;
        SplatInjector::new(&mut core.backend, &core.programs, &self.config).splat(&mut core.fields, request)
    }

    pub fn capture(&mut self) -> Result<Capture, BackendError> {
        let core = self.core.as_mut().ok_or(BackendError::Inactive)?;
        let (width, height) = fit_resolution(self.config.capture_resolution, core.surface.0, core.surface.1);
        let id = core.backend.create_target(&TargetDesc {
            label: "capture",
            width,
            height,
            format: TargetFormat::Rgba8,
            filter: Filter::Nearest,
        })?;

        let texels = core
            .render(&self.config, Target::Field(id), (width, height))
            .and_then(|()| core.backend.read_target(id));
        core.backend.release_target(id);
        let texels = texels?;

        let pixels = texels
            .iter()
            .flat_map(|texel| texel.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        debug!("Captured {width}x{height}");
        Ok(Capture { width, height, pixels })
    }

    /// The frame callback: advances the clock, follows the surface size,
    /// applies input, steps, composites to the screen and registers the next
    /// frame. Tokens other than the pending one are ignored.
    pub fn on_frame(&mut self, token: FrameToken, now: Instant, metrics: SurfaceMetrics) -> Result<(), BackendError> {
        if self.pending != Some(token) {
            trace!("Ignoring stale frame {token:?}");
            return Ok(());
        }
        self.pending = None;
        if self.core.is_none() {
            return Ok(());
        }

        let result = self.frame(now, metrics);
        self.pending = Some(self.scheduler.request_frame());
        result
    }

    fn frame(&mut self, now: Instant, metrics: SurfaceMetrics) -> Result<(), BackendError> {
        let dt = self.clock.tick(now);
        let core = self.core.as_mut().ok_or(BackendError::Inactive)?;

        let size = metrics.physical_size();
        if size.0 == 0 || size.1 == 0 {
            trace!("Surface has no area; skipping frame");
            return Ok(());
        }
        core.resize(&self.config, size)?;
        if self.config.colorful {
            core.pointers.update_colors(dt, self.config.color_update_speed, &mut self.rng);
        }
        core.apply_inputs(&self.config, self.input.drain(), &mut self.rng)?;

        if !self.config.paused {
            SimulationStepper::new(&mut core.backend, &core.programs, &self.config).step(&mut core.fields, dt)?;
        }
        let surface = core.surface;
        core.render(&self.config, Target::Screen, surface)?;
        core.backend.submit();
        Ok(())
    }
}

impl<B: Backend> Drop for FluidSimulator<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Unscheduled;

impl FrameScheduler for Unscheduled {
    fn request_frame(&mut self) -> FrameToken {
        FrameToken(0)
    }

    fn cancel_frame(&mut self, _token: FrameToken) {}
}
