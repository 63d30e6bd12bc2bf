use log::trace;
use wgpu::TextureFormat;

use super::{Backend, BackendError, Blend, Filter, Pass, Target, TargetDesc, TargetFormat, TargetId};
use crate::capabilities::Capabilities;
use crate::programs::{PassUniforms, Program};

#[derive(Debug, Clone, Default)]
pub struct Grid {
    width: u32,
    height: u32,
    stored_channels: usize,
    unorm: bool,
    filter: Option<Filter>,
    texels: Vec<[f32; 4]>,
}

impl Grid {
    fn new(width: u32, height: u32, format: TextureFormat, filter: Filter) -> Self {
        let (stored_channels, unorm) = match format {
            TextureFormat::R16Float | TextureFormat::R32Float => (1, false),
            TextureFormat::Rg16Float | TextureFormat::Rg32Float => (2, false),
            TextureFormat::Rgba16Float | TextureFormat::Rgba32Float => (4, false),
            _ => (4, true),
        };
        let width = width.max(1);
        let height = height.max(1);
        let mut grid = Self {
            width,
            height,
            stored_channels,
            unorm,
            filter: Some(filter),
            texels: Vec::new(),
        };
        let zero = grid.stored([0.0; 4]);
        grid.texels = vec![zero; (width * height) as usize];
        grid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texels(&self) -> &[[f32; 4]] {
        &self.texels
    }

    pub fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        self.texels[(y * self.width + x) as usize]
    }

    pub fn set_texel(&mut self, x: u32, y: u32, value: [f32; 4]) {
        let idx = (y * self.width + x) as usize;
        self.texels[idx] = self.stored(value);
    }

    fn stored(&self, value: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0, 0.0, 0.0, 1.0];
        out[..self.stored_channels].copy_from_slice(&value[..self.stored_channels]);
        if self.unorm {
            for c in &mut out {
                *c = (c.clamp(0.0, 1.0) * 255.0).round() / 255.0;
            }
        }
        out
    }

    fn fetch(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as u32;
        let y = y.clamp(0, self.height as i64 - 1) as u32;
        self.texel(x, y)
    }

    pub fn sample(&self, uv: [f32; 2], filter: Filter) -> [f32; 4] {
        let (w, h) = (self.width as f32, self.height as f32);
        match filter {
            Filter::Nearest => self.fetch((uv[0] * w).floor() as i64, (uv[1] * h).floor() as i64),
            Filter::Linear => {
                let sx = uv[0] * w - 0.5;
                let sy = uv[1] * h - 0.5;
                let (x0, y0) = (sx.floor(), sy.floor());
                let (fx, fy) = (sx - x0, sy - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.fetch(x0, y0);
                let b = self.fetch(x0 + 1, y0);
                let c = self.fetch(x0, y0 + 1);
                let d = self.fetch(x0 + 1, y0 + 1);
                mix4(mix4(a, b, fx), mix4(c, d, fx), fy)
            }
        }
    }
}

fn mix4(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

fn add4(a: [f32; 4], b: [f32; 4]) -> [f32; 4] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

fn scale4(a: [f32; 4], s: f32) -> [f32; 4] {
    [a[0] * s, a[1] * s, a[2] * s, a[3] * s]
}

fn offset(uv: [f32; 2], dx: f32, dy: f32) -> [f32; 2] {
    [uv[0] + dx, uv[1] + dy]
}

fn length3(c: [f32; 4]) -> f32 {
    (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt()
}

fn brightness(c: [f32; 4]) -> f32 {
    c[0].max(c[1]).max(c[2])
}

/// `‖∇²p − ∇·v‖₂` with the same clamp-to-edge neighbors the Jacobi pass reads.
pub fn pressure_residual(pressure: &Grid, divergence: &Grid) -> f32 {
    let mut sum = 0.0f64;
    for y in 0..pressure.height {
        for x in 0..pressure.width {
            let (xi, yi) = (x as i64, y as i64);
            let c = pressure.fetch(xi, yi)[0];
            let laplacian = pressure.fetch(xi - 1, yi)[0]
                + pressure.fetch(xi + 1, yi)[0]
                + pressure.fetch(xi, yi - 1)[0]
                + pressure.fetch(xi, yi + 1)[0]
                - 4.0 * c;
            let r = (laplacian - divergence.texel(x, y)[0]) as f64;
            sum += r * r;
        }
    }
    sum.sqrt() as f32
}

pub struct CpuBackend {
    caps: Capabilities,
    surface: Grid,
    targets: Vec<Option<Grid>>,
    draws: usize,
}

impl CpuBackend {
    pub fn new(caps: Capabilities, width: u32, height: u32) -> Self {
        Self {
            caps,
            surface: Grid::new(width, height, TextureFormat::Rgba8Unorm, Filter::Nearest),
            targets: Vec::new(),
            draws: 0,
        }
    }

    pub fn screen(&self) -> &Grid {
        &self.surface
    }

    pub fn target(&self, id: TargetId) -> Option<&Grid> {
        self.targets.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn target_mut(&mut self, id: TargetId) -> Option<&mut Grid> {
        self.targets.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn draw_count(&self) -> usize {
        self.draws
    }

    pub fn live_targets(&self) -> usize {
        self.targets.iter().flatten().count()
    }

    fn grid(&self, id: TargetId) -> Result<&Grid, BackendError> {
        self.target(id).ok_or(BackendError::UnknownTarget(id))
    }

    fn filter_for(&self, grid: &Grid) -> Filter {
        match grid.filter {
            Some(Filter::Linear) if self.caps.linear_filtering => Filter::Linear,
            _ => Filter::Nearest,
        }
    }
}

struct Kernel<'a> {
    backend: &'a CpuBackend,
    pass: &'a Pass,
    inputs: [Option<&'a Grid>; 3],
}

impl Kernel<'_> {
    fn tex(&self, slot: usize, uv: [f32; 2]) -> [f32; 4] {
        match self.inputs[slot] {
            Some(grid) => grid.sample(uv, self.backend.filter_for(grid)),
            None => [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn bilerp(&self, slot: usize, uv: [f32; 2], texel: [f32; 2]) -> [f32; 4] {
        let sx = uv[0] / texel[0] - 0.5;
        let sy = uv[1] / texel[1] - 0.5;
        let (ix, iy) = (sx.floor(), sy.floor());
        let (fx, fy) = (sx - ix, sy - iy);
        let at = |ox: f32, oy: f32| self.tex(slot, [(ix + ox) * texel[0], (iy + oy) * texel[1]]);
        let a = at(0.5, 0.5);
        let b = at(1.5, 0.5);
        let c = at(0.5, 1.5);
        let d = at(1.5, 1.5);
        mix4(mix4(a, b, fx), mix4(c, d, fx), fy)
    }

    fn neighbors(&self, slot: usize, uv: [f32; 2], t: [f32; 2]) -> [[f32; 4]; 4] {
        [
            self.tex(slot, offset(uv, -t[0], 0.0)),
            self.tex(slot, offset(uv, t[0], 0.0)),
            self.tex(slot, offset(uv, 0.0, t[1])),
            self.tex(slot, offset(uv, 0.0, -t[1])),
        ]
    }

    fn shade(&self, uv: [f32; 2]) -> [f32; 4] {
        let u: &PassUniforms = &self.pass.uniforms;
        let t = u.texel_size;
        match self.pass.desc.program {
            Program::Copy => self.tex(0, uv),
            Program::Clear => scale4(self.tex(0, uv), u.value),
            Program::Color => u.color,
            Program::Splat => {
                let mut p = [uv[0] - u.point[0], uv[1] - u.point[1]];
                p[0] *= u.aspect_ratio;
                let falloff = (-(p[0] * p[0] + p[1] * p[1]) / u.radius).exp();
                let base = self.tex(0, uv);
                [
                    base[0] + falloff * u.color[0],
                    base[1] + falloff * u.color[1],
                    base[2] + falloff * u.color[2],
                    1.0,
                ]
            }
            Program::Advection => {
                let result = if self.pass.desc.keywords.manual_filtering {
                    let v = self.bilerp(0, uv, t);
                    let coord = [uv[0] - u.dt * v[0] * t[0], uv[1] - u.dt * v[1] * t[1]];
                    self.bilerp(1, coord, u.source_texel_size)
                } else {
                    let v = self.tex(0, uv);
                    let coord = [uv[0] - u.dt * v[0] * t[0], uv[1] - u.dt * v[1] * t[1]];
                    self.tex(1, coord)
                };
                scale4(result, 1.0 / (1.0 + u.dissipation * u.dt))
            }
            Program::Curl => {
                let [l, r, tp, b] = self.neighbors(0, uv, t);
                let vorticity = r[1] - l[1] - tp[0] + b[0];
                [0.5 * vorticity, 0.0, 0.0, 1.0]
            }
            Program::Vorticity => {
                let [l, r, tp, b] = self.neighbors(1, uv, t);
                let c = self.tex(1, uv)[0];
                let mut force = [
                    0.5 * (tp[0].abs() - b[0].abs()),
                    0.5 * (r[0].abs() - l[0].abs()),
                ];
                let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
                force = [force[0] / len * u.curl * c, -(force[1] / len * u.curl * c)];
                let v = self.tex(0, uv);
                [
                    (v[0] + force[0] * u.dt).clamp(-1000.0, 1000.0),
                    (v[1] + force[1] * u.dt).clamp(-1000.0, 1000.0),
                    0.0,
                    1.0,
                ]
            }
            Program::Divergence => {
                let [l, r, tp, b] = self.neighbors(0, uv, t);
                let c = self.tex(0, uv);
                let mut left = l[0];
                let mut right = r[0];
                let mut top = tp[1];
                let mut bottom = b[1];
                if uv[0] - t[0] < 0.0 {
                    left = -c[0];
                }
                if uv[0] + t[0] > 1.0 {
                    right = -c[0];
                }
                if uv[1] + t[1] > 1.0 {
                    top = -c[1];
                }
                if uv[1] - t[1] < 0.0 {
                    bottom = -c[1];
                }
                [0.5 * (right - left + top - bottom), 0.0, 0.0, 1.0]
            }
            Program::Pressure => {
                let [l, r, tp, b] = self.neighbors(0, uv, t);
                let divergence = self.tex(1, uv)[0];
                [(l[0] + r[0] + b[0] + tp[0] - divergence) * 0.25, 0.0, 0.0, 1.0]
            }
            Program::GradientSubtract => {
                let [l, r, tp, b] = self.neighbors(0, uv, t);
                let v = self.tex(1, uv);
                [
                    v[0] - u.value * (r[0] - l[0]),
                    v[1] - u.value * (tp[0] - b[0]),
                    0.0,
                    1.0,
                ]
            }
            Program::Display => self.display(uv),
            Program::BloomPrefilter => {
                let c = self.tex(0, uv);
                let br = brightness(c);
                let rq = (br - u.curve[0]).clamp(0.0, u.curve[1]);
                let rq = u.curve[2] * rq * rq;
                let k = rq.max(br - u.threshold) / br.max(0.0001);
                [c[0] * k, c[1] * k, c[2] * k, 0.0]
            }
            Program::BloomBlur | Program::BloomFinal => {
                let [l, r, tp, b] = self.neighbors(0, uv, t);
                let sum = scale4(add4(add4(l, r), add4(tp, b)), 0.25);
                if self.pass.desc.program == Program::BloomFinal {
                    scale4(sum, u.value)
                } else {
                    sum
                }
            }
            Program::SunraysMask => {
                let mut c = self.tex(0, uv);
                let br = brightness(c);
                c[3] = 1.0 - (br * 20.0).max(0.0).min(0.8);
                c
            }
            Program::Sunrays => {
                const ITERATIONS: usize = 16;
                const DENSITY: f32 = 0.3;
                const DECAY: f32 = 0.95;
                const EXPOSURE: f32 = 0.7;
                let step = [
                    (uv[0] - 0.5) / ITERATIONS as f32 * DENSITY,
                    (uv[1] - 0.5) / ITERATIONS as f32 * DENSITY,
                ];
                let mut coord = uv;
                let mut illumination_decay = 1.0;
                let mut color = self.tex(0, uv)[3];
                for _ in 0..ITERATIONS {
                    coord = [coord[0] - step[0], coord[1] - step[1]];
                    color += self.tex(0, coord)[3] * illumination_decay * u.value;
                    illumination_decay *= DECAY;
                }
                [color * EXPOSURE, 0.0, 0.0, 1.0]
            }
            Program::Blur => {
                let d = [u.direction[0] * 1.333_333_3, u.direction[1] * 1.333_333_3];
                let sum = add4(
                    scale4(self.tex(0, uv), 0.294_117_64),
                    add4(
                        scale4(self.tex(0, offset(uv, -d[0], -d[1])), 0.352_941_17),
                        scale4(self.tex(0, offset(uv, d[0], d[1])), 0.352_941_17),
                    ),
                );
                sum
            }
        }
    }

    fn display(&self, uv: [f32; 2]) -> [f32; 4] {
        let keywords = self.pass.desc.keywords;
        let t = self.pass.uniforms.texel_size;
        let mut c = self.tex(0, uv);

        if keywords.shading {
            let [l, r, tp, b] = self.neighbors(0, uv, t);
            let dx = length3(r) - length3(l);
            let dy = length3(tp) - length3(b);
            let nz = (t[0] * t[0] + t[1] * t[1]).sqrt();
            let len = (dx * dx + dy * dy + nz * nz).sqrt().max(1e-12);
            let diffuse = (nz / len + 0.7).clamp(0.7, 1.0);
            c = scale4(c, diffuse);
        }

        let mut bloom = if keywords.bloom && self.inputs[1].is_some() {
            self.tex(1, uv)
        } else {
            [0.0; 4]
        };

        if keywords.sunrays && self.inputs[2].is_some() {
            let rays = self.tex(2, uv)[0];
            c = scale4(c, rays);
            bloom = scale4(bloom, rays);
        }

        if keywords.bloom {
            for i in 0..3 {
                let b = bloom[i].max(0.0);
                c[i] += (1.055 * b.powf(0.416_666_67) - 0.055).max(0.0);
            }
        }

        [c[0], c[1], c[2], brightness(c)]
    }
}

fn blend(mode: Blend, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    match mode {
        Blend::Replace => src,
        Blend::Additive => add4(src, dst),
        Blend::Premultiplied => add4(src, scale4(dst, 1.0 - src[3])),
    }
}

impl Backend for CpuBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface = Grid::new(width, height, TextureFormat::Rgba8Unorm, Filter::Nearest);
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError> {
        let format = match desc.format {
            TargetFormat::Field(channels) => self.caps.format(channels),
            TargetFormat::Rgba8 => TextureFormat::Rgba8Unorm,
        };
        let grid = Grid::new(desc.width, desc.height, format, desc.filter);
        let slot = match self.targets.iter().position(Option::is_none) {
            Some(free) => {
                self.targets[free] = Some(grid);
                free
            }
            None => {
                self.targets.push(Some(grid));
                self.targets.len() - 1
            }
        };
        trace!("cpu target {} {}x{} ({})", slot, desc.width, desc.height, desc.label);
        Ok(TargetId(slot as u32))
    }

    fn release_target(&mut self, id: TargetId) {
        if let Some(slot) = self.targets.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    fn draw(&mut self, pass: &Pass) -> Result<(), BackendError> {
        if let (true, Target::Field(out)) = (pass.aliases_output(), pass.target) {
            return Err(BackendError::AliasedPass(out));
        }
        for id in pass.inputs.iter().flatten() {
            self.grid(*id)?;
        }

        let mut out = match pass.target {
            Target::Field(id) => self
                .targets
                .get_mut(id.0 as usize)
                .and_then(Option::take)
                .ok_or(BackendError::UnknownTarget(id))?,
            Target::Screen => std::mem::take(&mut self.surface),
        };

        {
            let kernel = Kernel {
                backend: self,
                pass,
                inputs: pass.inputs.map(|slot| slot.and_then(|id| self.target(id))),
            };
            let presenting = pass.desc.program.vertex_entry() == "vs_present";
            let (w, h) = (out.width, out.height);
            for y in 0..h {
                for x in 0..w {
                    let v = (y as f32 + 0.5) / h as f32;
                    let uv = [(x as f32 + 0.5) / w as f32, if presenting { 1.0 - v } else { v }];
                    let src = kernel.shade(uv);
                    let value = blend(pass.blend, src, out.texel(x, y));
                    out.set_texel(x, y, value);
                }
            }
        }

        match pass.target {
            Target::Field(id) => self.targets[id.0 as usize] = Some(out),
            Target::Screen => self.surface = out,
        }
        self.draws += 1;
        Ok(())
    }

    fn submit(&mut self) {}

    fn read_target(&mut self, id: TargetId) -> Result<Vec<[f32; 4]>, BackendError> {
        Ok(self.grid(id)?.texels.clone())
    }

    fn release_all(&mut self) {
        self.targets.clear();
    }
}
