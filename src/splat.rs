use rand::Rng;

use crate::backend::{Backend, BackendError, Pass, Target};
use crate::color::{generate_color, DyeColor};
use crate::config::FluidConfig;
use crate::fields::FieldArena;
use crate::pointer::Pointer;
use crate::programs::{PassUniforms, ProgramSet};

const RANDOM_COLOR_BOOST: f32 = 10.0;
const RANDOM_FORCE: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRequest {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: DyeColor,
}

impl SplatRequest {
    pub fn from_pointer(pointer: &Pointer, force: f32) -> Self {
        Self {
            x: pointer.texcoord[0],
            y: pointer.texcoord[1],
            dx: pointer.delta[0] * force,
            dy: pointer.delta[1] * force,
            color: pointer.color,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let color = generate_color(rng).scaled(RANDOM_COLOR_BOOST);
        Self {
            x: rng.gen(),
            y: rng.gen(),
            dx: RANDOM_FORCE * (rng.gen::<f32>() - 0.5),
            dy: RANDOM_FORCE * (rng.gen::<f32>() - 0.5),
            color,
        }
    }
}

/// Kernel radius: the configured radius in hundredths, stretched along x on
/// wide surfaces so splats stay round.
pub fn splat_radius(radius: f32, aspect_ratio: f32) -> f32 {
    let radius = radius / 100.0;
    if aspect_ratio > 1.0 {
        radius * aspect_ratio
    } else {
        radius
    }
}

pub struct SplatInjector<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    programs: &'a ProgramSet,
    aspect_ratio: f32,
    radius: f32,
}

impl<'a, B: Backend + ?Sized> SplatInjector<'a, B> {
    pub fn new(backend: &'a mut B, programs: &'a ProgramSet, config: &FluidConfig) -> Self {
        let (width, height) = backend.surface_size();
        let aspect_ratio = width.max(1) as f32 / height.max(1) as f32;
        Self {
            backend,
            programs,
            aspect_ratio,
            radius: splat_radius(config.splat_radius, aspect_ratio),
        }
    }

    pub fn splat(&mut self, fields: &mut FieldArena, request: &SplatRequest) -> Result<(), BackendError> {
        let force = [request.dx, request.dy, 0.0, 1.0];
        let velocity = Pass::new(
            self.programs.splat,
            self.uniforms(fields.velocity.size(), request, force),
            Target::Field(fields.velocity.write()),
        )
        .input(0, fields.velocity.read());
        self.backend.draw(&velocity)?;
        fields.velocity.swap();

        let dye = Pass::new(
            self.programs.splat,
            self.uniforms(fields.dye.size(), request, request.color.to_array()),
            Target::Field(fields.dye.write()),
        )
        .input(0, fields.dye.read());
        self.backend.draw(&dye)?;
        fields.dye.swap();
        Ok(())
    }

    fn uniforms(&self, (width, height): (u32, u32), request: &SplatRequest, color: [f32; 4]) -> PassUniforms {
        PassUniforms {
            point: [request.x, request.y],
            color,
            aspect_ratio: self.aspect_ratio,
            radius: self.radius,
            ..PassUniforms::with_texel(width, height)
        }
    }

    pub fn multiple_splats<R: Rng + ?Sized>(
        &mut self,
        fields: &mut FieldArena,
        amount: u32,
        rng: &mut R,
    ) -> Result<(), BackendError> {
        for _ in 0..amount {
            let request = SplatRequest::random(rng);
            self.splat(fields, &request)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SplatStack {
    batches: Vec<u32>,
}

impl SplatStack {
    pub fn push(&mut self, amount: u32) {
        self.batches.push(amount);
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.batches.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::capabilities::Capabilities;
    use crate::fields::FieldLayout;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(width: u32, height: u32) -> (CpuBackend, ProgramSet, FluidConfig, FieldArena) {
        let caps = Capabilities::full_float();
        let config = FluidConfig {
            sim_resolution: 32,
            dye_resolution: 64,
            ..FluidConfig::default()
        };
        let programs = ProgramSet::select(&caps, &config);
        let mut backend = CpuBackend::new(caps, width, height);
        let layout = FieldLayout::new(&config, width, height);
        let fields = FieldArena::allocate(&mut backend, &layout).unwrap();
        (backend, programs, config, fields)
    }

    #[test]
    fn radius_stretches_on_wide_surfaces_only() {
        assert!((splat_radius(0.25, 1.0) - 0.0025).abs() < 1e-9);
        assert!((splat_radius(0.25, 2.0) - 0.005).abs() < 1e-9);
        assert!((splat_radius(0.25, 0.5) - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn splat_peaks_at_its_center() {
        let (mut backend, programs, config, mut fields) = setup(64, 64);
        let before = fields.velocity.read();
        let request = SplatRequest {
            x: 0.5,
            y: 0.5,
            dx: 200.0,
            dy: -100.0,
            color: DyeColor::new(1.0, 0.5, 0.0),
        };
        SplatInjector::new(&mut backend, &programs, &config)
            .splat(&mut fields, &request)
            .unwrap();
        assert_ne!(fields.velocity.read(), before);

        let velocity = backend.target(fields.velocity.read()).unwrap();
        let center = velocity.texel(16, 16);
        let corner = velocity.texel(0, 0);
        assert!(center[0] > 150.0 && center[1] < -75.0);
        assert!(corner[0].abs() < 1e-3 && corner[1].abs() < 1e-3);

        let dye = backend.target(fields.dye.read()).unwrap();
        let center = dye.texel(32, 32);
        assert!(center[0] > 0.8 && center[1] > 0.4 && center[2] == 0.0);
        assert!(dye.texel(0, 63)[0] < 1e-3);
    }

    #[test]
    fn splats_accumulate() {
        let (mut backend, programs, config, mut fields) = setup(32, 32);
        // Exactly on a texel center of the 32x32 velocity field.
        let request = SplatRequest {
            x: 0.515625,
            y: 0.515625,
            dx: 10.0,
            dy: 0.0,
            color: DyeColor::new(0.1, 0.1, 0.1),
        };
        let mut injector = SplatInjector::new(&mut backend, &programs, &config);
        injector.splat(&mut fields, &request).unwrap();
        injector.splat(&mut fields, &request).unwrap();
        let velocity = backend.target(fields.velocity.read()).unwrap();
        assert!(velocity.texel(16, 16)[0] > 19.0);
    }

    #[test]
    fn multiple_splats_draw_two_passes_each() {
        let (mut backend, programs, config, mut fields) = setup(32, 16);
        let mut rng = StdRng::seed_from_u64(3);
        SplatInjector::new(&mut backend, &programs, &config)
            .multiple_splats(&mut fields, 5, &mut rng)
            .unwrap();
        assert_eq!(backend.draw_count(), 10);
    }

    #[test]
    fn random_requests_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let r = SplatRequest::random(&mut rng);
            assert!((0.0..1.0).contains(&r.x) && (0.0..1.0).contains(&r.y));
            assert!(r.dx.abs() <= 500.0 && r.dy.abs() <= 500.0);
            assert!(r.color.r <= 1.5 && r.color.g <= 1.5 && r.color.b <= 1.5);
        }
    }

    #[test]
    fn stack_pops_most_recent_batch() {
        let mut stack = SplatStack::default();
        stack.push(5);
        stack.push(12);
        assert_eq!(stack.pop(), Some(12));
        assert_eq!(stack.pop(), Some(5));
        assert_eq!(stack.pop(), None);
    }
}
