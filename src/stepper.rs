use log::trace;

use crate::backend::{Backend, BackendError, Pass, Target};
use crate::config::FluidConfig;
use crate::fields::FieldArena;
use crate::programs::{PassUniforms, ProgramSet};

pub struct SimulationStepper<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    programs: &'a ProgramSet,
    config: &'a FluidConfig,
}

impl<'a, B: Backend + ?Sized> SimulationStepper<'a, B> {
    pub fn new(backend: &'a mut B, programs: &'a ProgramSet, config: &'a FluidConfig) -> Self {
        Self {
            backend,
            programs,
            config,
        }
    }

    pub fn step(&mut self, fields: &mut FieldArena, dt: f32) -> Result<(), BackendError> {
        trace!("Step dt={:.5}", dt);
        self.curl(fields)?;
        self.vorticity(fields, dt)?;
        self.divergence(fields)?;
        for _ in 0..self.config.pressure_iterations {
            self.pressure_iteration(fields)?;
        }
        self.gradient_subtract(fields)?;
        self.advect(fields, dt)
    }

    fn sim_uniforms(fields: &FieldArena) -> PassUniforms {
        let (w, h) = fields.velocity.size();
        PassUniforms::with_texel(w, h)
    }

    pub fn curl(&mut self, fields: &mut FieldArena) -> Result<(), BackendError> {
        let pass = Pass::new(
            self.programs.curl,
            Self::sim_uniforms(fields),
            Target::Field(fields.curl.id),
        )
        .input(0, fields.velocity.read());
        self.backend.draw(&pass)
    }

    pub fn vorticity(&mut self, fields: &mut FieldArena, dt: f32) -> Result<(), BackendError> {
        let uniforms = PassUniforms {
            curl: self.config.curl,
            dt,
            ..Self::sim_uniforms(fields)
        };
        let pass = Pass::new(self.programs.vorticity, uniforms, Target::Field(fields.velocity.write()))
            .input(0, fields.velocity.read())
            .input(1, fields.curl.id);
        self.backend.draw(&pass)?;
        fields.velocity.swap();
        Ok(())
    }

    pub fn divergence(&mut self, fields: &mut FieldArena) -> Result<(), BackendError> {
        let pass = Pass::new(
            self.programs.divergence,
            Self::sim_uniforms(fields),
            Target::Field(fields.divergence.id),
        )
        .input(0, fields.velocity.read());
        self.backend.draw(&pass)
    }

    /// One Jacobi relaxation of `∇²p = ∇·v`. The previous frame's pressure
    /// is the starting guess.
    pub fn pressure_iteration(&mut self, fields: &mut FieldArena) -> Result<(), BackendError> {
        let pass = Pass::new(
            self.programs.pressure,
            Self::sim_uniforms(fields),
            Target::Field(fields.pressure.write()),
        )
        .input(0, fields.pressure.read())
        .input(1, fields.divergence.id);
        self.backend.draw(&pass)?;
        fields.pressure.swap();
        Ok(())
    }

    pub fn gradient_subtract(&mut self, fields: &mut FieldArena) -> Result<(), BackendError> {
        let uniforms = PassUniforms {
            value: self.config.pressure,
            ..Self::sim_uniforms(fields)
        };
        let pass = Pass::new(
            self.programs.gradient_subtract,
            uniforms,
            Target::Field(fields.velocity.write()),
        )
        .input(0, fields.pressure.read())
        .input(1, fields.velocity.read());
        self.backend.draw(&pass)?;
        fields.velocity.swap();
        Ok(())
    }

    pub fn advect(&mut self, fields: &mut FieldArena, dt: f32) -> Result<(), BackendError> {
        let velocity_texel = fields.velocity.texel_size();
        let uniforms = PassUniforms {
            source_texel_size: velocity_texel,
            dt,
            dissipation: self.config.velocity_dissipation,
            ..Self::sim_uniforms(fields)
        };
        let pass = Pass::new(self.programs.advection, uniforms, Target::Field(fields.velocity.write()))
            .input(0, fields.velocity.read())
            .input(1, fields.velocity.read());
        self.backend.draw(&pass)?;
        fields.velocity.swap();

        let uniforms = PassUniforms {
            source_texel_size: fields.dye.texel_size(),
            dissipation: self.config.density_dissipation,
            ..uniforms
        };
        let pass = Pass::new(self.programs.advection, uniforms, Target::Field(fields.dye.write()))
            .input(0, fields.velocity.read())
            .input(1, fields.dye.read());
        self.backend.draw(&pass)?;
        fields.dye.swap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::{pressure_residual, Grid};
    use crate::backend::CpuBackend;
    use crate::capabilities::Capabilities;
    use crate::fields::FieldLayout;
    use crate::programs::Program;

    fn setup(config: FluidConfig) -> (CpuBackend, ProgramSet, FluidConfig, FieldArena) {
        let caps = Capabilities::full_float();
        let programs = ProgramSet::select(&caps, &config);
        let mut backend = CpuBackend::new(caps, 64, 64);
        let layout = FieldLayout::new(&config, 64, 64);
        let fields = FieldArena::allocate(&mut backend, &layout).unwrap();
        (backend, programs, config, fields)
    }

    fn fill_source(backend: &mut CpuBackend, fields: &FieldArena) {
        let (w, h) = fields.velocity.size();
        let grid = backend.target_mut(fields.velocity.read()).unwrap();
        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = (x as f32 + 0.5 - cx, y as f32 + 0.5 - cy);
                let falloff = (-(dx * dx + dy * dy) / 18.0).exp();
                grid.set_texel(x, y, [dx * falloff, dy * falloff, 0.0, 1.0]);
            }
        }
    }

    fn norm(grid: &Grid) -> f32 {
        grid.texels().iter().map(|t| t[0] * t[0]).sum::<f32>().sqrt()
    }

    #[test]
    fn jacobi_residual_never_grows() {
        let config = FluidConfig {
            sim_resolution: 16,
            ..FluidConfig::default()
        };
        let (mut backend, programs, config, mut fields) = setup(config);
        fill_source(&mut backend, &fields);

        let mut stepper = SimulationStepper::new(&mut backend, &programs, &config);
        stepper.divergence(&mut fields).unwrap();

        let residual = |backend: &CpuBackend, fields: &FieldArena| {
            pressure_residual(
                backend.target(fields.pressure.read()).unwrap(),
                backend.target(fields.divergence.id).unwrap(),
            )
        };
        let mut previous = residual(&backend, &fields);
        assert!(previous > 0.0);
        for _ in 0..30 {
            SimulationStepper::new(&mut backend, &programs, &config)
                .pressure_iteration(&mut fields)
                .unwrap();
            let current = residual(&backend, &fields);
            assert!(current <= previous * 1.0001 + 1e-6, "{current} > {previous}");
            previous = current;
        }
    }

    #[test]
    fn projection_reduces_divergence() {
        let config = FluidConfig {
            sim_resolution: 16,
            pressure_iterations: 200,
            ..FluidConfig::default()
        };
        let (mut backend, programs, config, mut fields) = setup(config);
        fill_source(&mut backend, &fields);

        SimulationStepper::new(&mut backend, &programs, &config)
            .divergence(&mut fields)
            .unwrap();
        let before = norm(backend.target(fields.divergence.id).unwrap());

        let mut stepper = SimulationStepper::new(&mut backend, &programs, &config);
        for _ in 0..config.pressure_iterations {
            stepper.pressure_iteration(&mut fields).unwrap();
        }
        stepper.gradient_subtract(&mut fields).unwrap();
        stepper.divergence(&mut fields).unwrap();
        let after = norm(backend.target(fields.divergence.id).unwrap());
        assert!(after < 0.9 * before, "divergence {before} -> {after}");
    }

    #[test]
    fn still_dye_only_dissipates() {
        let config = FluidConfig {
            sim_resolution: 16,
            dye_resolution: 32,
            ..FluidConfig::default()
        };
        let (mut backend, programs, config, mut fields) = setup(config);
        let (w, h) = fields.dye.size();
        let dye = backend.target_mut(fields.dye.read()).unwrap();
        for y in 0..h {
            for x in 0..w {
                dye.set_texel(x, y, [1.0, 0.5, 0.25, 1.0]);
            }
        }

        let dt = 0.016;
        SimulationStepper::new(&mut backend, &programs, &config)
            .step(&mut fields, dt)
            .unwrap();

        let decay = 1.0 / (1.0 + config.density_dissipation * dt);
        let dye = backend.target(fields.dye.read()).unwrap();
        for texel in dye.texels() {
            assert!((texel[0] - decay).abs() < 1e-5);
            assert!((texel[1] - 0.5 * decay).abs() < 1e-5);
        }
        let velocity = backend.target(fields.velocity.read()).unwrap();
        assert!(velocity.texels().iter().all(|t| t[0] == 0.0 && t[1] == 0.0));
    }

    #[test]
    fn step_runs_every_stage_in_order() {
        let config = FluidConfig {
            sim_resolution: 16,
            dye_resolution: 16,
            pressure_iterations: 3,
            ..FluidConfig::default()
        };
        let (mut backend, programs, config, mut fields) = setup(config);
        SimulationStepper::new(&mut backend, &programs, &config)
            .step(&mut fields, 0.01)
            .unwrap();
        // curl, vorticity, divergence, 3 jacobi, gradient, 2 advections
        assert_eq!(backend.draw_count(), 9);
        assert_eq!(programs.advection.program, Program::Advection);
    }

    #[test]
    fn manual_filtering_matches_hardware_filtering() {
        let base = FluidConfig {
            sim_resolution: 16,
            dye_resolution: 32,
            ..FluidConfig::default()
        };
        let run = |caps: Capabilities| {
            let programs = ProgramSet::select(&caps, &base);
            let mut backend = CpuBackend::new(Capabilities::full_float(), 64, 64);
            let layout = FieldLayout::new(&base, 64, 64);
            let mut fields = FieldArena::allocate(&mut backend, &layout).unwrap();
            fill_source(&mut backend, &fields);
            let (w, h) = fields.dye.size();
            let dye = backend.target_mut(fields.dye.read()).unwrap();
            for y in 0..h {
                for x in 0..w {
                    dye.set_texel(x, y, [x as f32 / w as f32, y as f32 / h as f32, 0.0, 1.0]);
                }
            }
            SimulationStepper::new(&mut backend, &programs, &base)
                .advect(&mut fields, 0.016)
                .unwrap();
            backend.target(fields.dye.read()).unwrap().texels().to_vec()
        };

        let hardware = run(Capabilities::full_float());
        let manual = run(Capabilities {
            linear_filtering: false,
            ..Capabilities::full_float()
        });
        for (a, b) in hardware.iter().zip(&manual) {
            assert!((a[0] - b[0]).abs() < 1e-4 && (a[1] - b[1]).abs() < 1e-4);
        }
    }
}
