use log::trace;

use crate::backend::{Backend, BackendError, Blend, Pass, Target};
use crate::config::FluidConfig;
use crate::fields::{FieldArena, SingleField};
use crate::programs::{texel_size, PassUniforms, ProgramSet};

/// Soft-knee curve around the bloom threshold: `(threshold - knee, 2 * knee, 0.25 / knee)`.
pub fn bloom_curve(threshold: f32, soft_knee: f32) -> [f32; 4] {
    let knee = threshold * soft_knee + 0.0001;
    [threshold - knee, knee * 2.0, 0.25 / knee, 0.0]
}

pub struct Renderer<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    programs: &'a ProgramSet,
    config: &'a FluidConfig,
}

impl<'a, B: Backend + ?Sized> Renderer<'a, B> {
    pub fn new(backend: &'a mut B, programs: &'a ProgramSet, config: &'a FluidConfig) -> Self {
        Self {
            backend,
            programs,
            config,
        }
    }

    pub fn render(&mut self, fields: &FieldArena, target: Target, size: (u32, u32)) -> Result<(), BackendError> {
        if self.config.bloom {
            self.bloom(fields)?;
        }
        if self.config.sunrays {
            self.sunrays(fields)?;
            self.blur(fields.sunrays, fields.sunrays_temp, 1)?;
        }

        let display_blend = if self.config.transparent {
            Blend::Replace
        } else {
            self.backdrop(target)?;
            Blend::Premultiplied
        };
        self.display(fields, target, size, display_blend)
    }

    fn backdrop(&mut self, target: Target) -> Result<(), BackendError> {
        let uniforms = PassUniforms {
            color: self.config.back_color.normalized(),
            ..PassUniforms::default()
        };
        self.backend.draw(&Pass::new(self.programs.color, uniforms, target))
    }

    fn display(
        &mut self,
        fields: &FieldArena,
        target: Target,
        (width, height): (u32, u32),
        blend: Blend,
    ) -> Result<(), BackendError> {
        let mut pass = Pass::new(self.programs.display, PassUniforms::with_texel(width, height), target)
            .input(0, fields.dye.read())
            .blend(blend);
        if self.config.bloom {
            pass = pass.input(1, fields.bloom.id);
        }
        if self.config.sunrays {
            pass = pass.input(2, fields.sunrays.id);
        }
        self.backend.draw(&pass)
    }

    fn bloom(&mut self, fields: &FieldArena) -> Result<(), BackendError> {
        let mips = &fields.bloom_mips;
        if mips.len() < 2 {
            trace!("Bloom skipped: {} mips", mips.len());
            let clear = PassUniforms {
                value: 0.0,
                ..PassUniforms::default()
            };
            return self
                .backend
                .draw(&Pass::new(self.programs.clear, clear, Target::Field(fields.bloom.id)));
        }

        let prefilter = PassUniforms {
            curve: bloom_curve(self.config.bloom_threshold, self.config.bloom_soft_knee),
            threshold: self.config.bloom_threshold,
            ..PassUniforms::default()
        };
        self.backend.draw(
            &Pass::new(self.programs.bloom_prefilter, prefilter, Target::Field(fields.bloom.id))
                .input(0, fields.dye.read()),
        )?;

        let mut last = fields.bloom;
        for &mip in mips {
            self.blur_step(last, mip, Blend::Replace)?;
            last = mip;
        }
        for &mip in mips.iter().rev().skip(1) {
            self.blur_step(last, mip, Blend::Additive)?;
            last = mip;
        }

        let last_uniforms = PassUniforms {
            value: self.config.bloom_intensity,
            texel_size: last.texel_size(),
            ..PassUniforms::default()
        };
        self.backend.draw(
            &Pass::new(self.programs.bloom_final, last_uniforms, Target::Field(fields.bloom.id))
                .input(0, last.id),
        )
    }

    fn blur_step(&mut self, source: SingleField, dest: SingleField, blend: Blend) -> Result<(), BackendError> {
        let uniforms = PassUniforms {
            texel_size: source.texel_size(),
            ..PassUniforms::default()
        };
        self.backend.draw(
            &Pass::new(self.programs.bloom_blur, uniforms, Target::Field(dest.id))
                .input(0, source.id)
                .blend(blend),
        )
    }

    fn sunrays(&mut self, fields: &FieldArena) -> Result<(), BackendError> {
        let (w, h) = fields.dye.size();
        let mask = fields.dye.write();
        self.backend.draw(
            &Pass::new(self.programs.sunrays_mask, PassUniforms::with_texel(w, h), Target::Field(mask))
                .input(0, fields.dye.read()),
        )?;

        let rays = PassUniforms {
            value: self.config.sunrays_weight,
            ..PassUniforms::with_texel(fields.sunrays.width, fields.sunrays.height)
        };
        self.backend.draw(
            &Pass::new(self.programs.sunrays, rays, Target::Field(fields.sunrays.id)).input(0, mask),
        )
    }

    fn blur(&mut self, target: SingleField, temp: SingleField, iterations: u32) -> Result<(), BackendError> {
        let [tx, ty] = texel_size(target.width, target.height);
        for _ in 0..iterations {
            let horizontal = PassUniforms {
                direction: [tx, 0.0],
                ..PassUniforms::default()
            };
            self.backend.draw(
                &Pass::new(self.programs.blur, horizontal, Target::Field(temp.id)).input(0, target.id),
            )?;
            let vertical = PassUniforms {
                direction: [0.0, ty],
                ..PassUniforms::default()
            };
            self.backend.draw(
                &Pass::new(self.programs.blur, vertical, Target::Field(target.id)).input(0, temp.id),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::capabilities::Capabilities;
    use crate::config::BackColor;
    use crate::fields::FieldLayout;

    fn setup(config: FluidConfig) -> (CpuBackend, ProgramSet, FluidConfig, FieldArena) {
        let caps = Capabilities::full_float();
        let programs = ProgramSet::select(&caps, &config);
        let mut backend = CpuBackend::new(caps, 32, 16);
        let layout = FieldLayout::new(&config, 32, 16);
        let fields = FieldArena::allocate(&mut backend, &layout).unwrap();
        (backend, programs, config, fields)
    }

    fn small() -> FluidConfig {
        FluidConfig {
            sim_resolution: 16,
            dye_resolution: 32,
            bloom_resolution: 32,
            bloom_iterations: 3,
            sunrays_resolution: 16,
            ..FluidConfig::default()
        }
    }

    fn fill_dye(backend: &mut CpuBackend, fields: &FieldArena, value: [f32; 4]) {
        let (w, h) = fields.dye.size();
        let dye = backend.target_mut(fields.dye.read()).unwrap();
        for y in 0..h {
            for x in 0..w {
                dye.set_texel(x, y, value);
            }
        }
    }

    #[test]
    fn soft_knee_curve() {
        let curve = bloom_curve(0.6, 0.7);
        let knee = 0.6 * 0.7 + 0.0001;
        assert!((curve[0] - (0.6 - knee)).abs() < 1e-6);
        assert!((curve[1] - 2.0 * knee).abs() < 1e-6);
        assert!((curve[2] - 0.25 / knee).abs() < 1e-5);
    }

    #[test]
    fn empty_dye_shows_the_backdrop() {
        let config = FluidConfig {
            back_color: BackColor { r: 26, g: 43, b: 60 },
            ..small()
        };
        let (mut backend, programs, config, fields) = setup(config);
        Renderer::new(&mut backend, &programs, &config)
            .render(&fields, Target::Screen, (32, 16))
            .unwrap();

        let expected = config.back_color.normalized();
        for texel in backend.screen().texels() {
            for c in 0..3 {
                assert!((texel[c] - expected[c]).abs() < 1.0 / 255.0);
            }
            assert_eq!(texel[3], 1.0);
        }
    }

    #[test]
    fn transparent_mode_carries_dye_alpha() {
        let config = FluidConfig {
            transparent: true,
            shading: false,
            bloom: false,
            sunrays: false,
            back_color: BackColor { r: 255, g: 0, b: 0 },
            ..small()
        };
        let (mut backend, programs, config, fields) = setup(config);
        fill_dye(&mut backend, &fields, [0.2, 0.4, 0.1, 1.0]);
        Renderer::new(&mut backend, &programs, &config)
            .render(&fields, Target::Screen, (32, 16))
            .unwrap();

        let texel = backend.screen().texel(5, 5);
        assert!((texel[0] - 0.2).abs() < 1.0 / 255.0);
        assert!((texel[1] - 0.4).abs() < 1.0 / 255.0);
        assert!((texel[3] - 0.4).abs() < 1.0 / 255.0);
        assert_eq!(backend.draw_count(), 1);
    }

    #[test]
    fn bright_dye_blooms() {
        let config = FluidConfig {
            sunrays: false,
            ..small()
        };
        let (mut backend, programs, config, fields) = setup(config);
        fill_dye(&mut backend, &fields, [2.0, 2.0, 2.0, 1.0]);
        Renderer::new(&mut backend, &programs, &config)
            .render(&fields, Target::Screen, (32, 16))
            .unwrap();

        // prefilter, 3 down, 2 up, final, backdrop, display
        assert_eq!(backend.draw_count(), 9);
        let bloom = backend.target(fields.bloom.id).unwrap();
        assert!(bloom.texels().iter().all(|t| t[0] > 0.5));
    }

    #[test]
    fn bloom_needs_two_mips() {
        let config = FluidConfig {
            sunrays: false,
            bloom_resolution: 8,
            ..small()
        };
        let (mut backend, programs, config, fields) = setup(config);
        assert_eq!(fields.bloom_mips.len(), 1);
        fill_dye(&mut backend, &fields, [2.0, 2.0, 2.0, 1.0]);
        Renderer::new(&mut backend, &programs, &config)
            .render(&fields, Target::Screen, (32, 16))
            .unwrap();

        // clear, backdrop, display
        assert_eq!(backend.draw_count(), 3);
        let bloom = backend.target(fields.bloom.id).unwrap();
        assert!(bloom.texels().iter().all(|t| t[..3] == [0.0, 0.0, 0.0]));
    }

    #[test]
    fn dark_dye_leaves_sunrays_lit() {
        let config = FluidConfig {
            bloom: false,
            ..small()
        };
        let (mut backend, programs, config, fields) = setup(config);
        Renderer::new(&mut backend, &programs, &config)
            .render(&fields, Target::Screen, (32, 16))
            .unwrap();

        // An all-dark mask lets every ray through: (1 + weight * sum(0.95^i)) * 0.7.
        let lit: f32 = (1.0 + (0..16).map(|i| 0.95f32.powi(i)).sum::<f32>()) * 0.7;
        let rays = backend.target(fields.sunrays.id).unwrap();
        for texel in rays.texels() {
            assert!((texel[0] - lit).abs() < 1e-3, "{} vs {}", texel[0], lit);
        }
    }
}
