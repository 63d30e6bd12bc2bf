use log::debug;

use crate::backend::{Backend, BackendError, Filter, Pass, Target, TargetDesc, TargetFormat, TargetId};
use crate::capabilities::Channels;
use crate::config::FluidConfig;
use crate::programs::{texel_size, PassUniforms, ProgramSet};

pub fn fit_resolution(resolution: u32, width: u32, height: u32) -> (u32, u32) {
    let resolution = resolution.max(1);
    let (width, height) = (width.max(1), height.max(1));
    let scaled = |short: u32, long: u32| {
        ((f64::from(resolution) * f64::from(short) / f64::from(long)).round() as u32).max(1)
    };
    if width >= height {
        (resolution, scaled(height, width))
    } else {
        (scaled(width, height), resolution)
    }
}

struct FieldKind {
    label: &'static str,
    format: TargetFormat,
    filter: Filter,
}

const VELOCITY: FieldKind = FieldKind {
    label: "velocity",
    format: TargetFormat::Field(Channels::Rg),
    filter: Filter::Linear,
};
const DYE: FieldKind = FieldKind {
    label: "dye",
    format: TargetFormat::Field(Channels::Rgba),
    filter: Filter::Linear,
};
const PRESSURE: FieldKind = FieldKind {
    label: "pressure",
    format: TargetFormat::Field(Channels::R),
    filter: Filter::Nearest,
};
const DIVERGENCE: FieldKind = FieldKind {
    label: "divergence",
    format: TargetFormat::Field(Channels::R),
    filter: Filter::Nearest,
};
const CURL: FieldKind = FieldKind {
    label: "curl",
    format: TargetFormat::Field(Channels::R),
    filter: Filter::Nearest,
};
const BLOOM: FieldKind = FieldKind {
    label: "bloom",
    format: TargetFormat::Field(Channels::Rgba),
    filter: Filter::Linear,
};
const SUNRAYS: FieldKind = FieldKind {
    label: "sunrays",
    format: TargetFormat::Field(Channels::R),
    filter: Filter::Linear,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleField {
    pub id: TargetId,
    pub width: u32,
    pub height: u32,
}

impl SingleField {
    fn create<B: Backend + ?Sized>(
        backend: &mut B,
        kind: &FieldKind,
        (width, height): (u32, u32),
    ) -> Result<Self, BackendError> {
        let id = backend.create_target(&TargetDesc {
            label: kind.label,
            width,
            height,
            format: kind.format,
            filter: kind.filter,
        })?;
        Ok(Self { id, width, height })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn texel_size(&self) -> [f32; 2] {
        texel_size(self.width, self.height)
    }

    fn release<B: Backend + ?Sized>(&self, backend: &mut B) {
        backend.release_target(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleField {
    targets: [TargetId; 2],
    read: usize,
    pub width: u32,
    pub height: u32,
}

impl DoubleField {
    fn create<B: Backend + ?Sized>(
        backend: &mut B,
        kind: &FieldKind,
        size: (u32, u32),
    ) -> Result<Self, BackendError> {
        let first = SingleField::create(backend, kind, size)?;
        let second = match SingleField::create(backend, kind, size) {
            Ok(second) => second,
            Err(err) => {
                first.release(backend);
                return Err(err);
            }
        };
        Ok(Self {
            targets: [first.id, second.id],
            read: 0,
            width: first.width,
            height: first.height,
        })
    }

    pub fn read(&self) -> TargetId {
        self.targets[self.read]
    }

    pub fn write(&self) -> TargetId {
        self.targets[1 - self.read]
    }

    pub fn swap(&mut self) {
        self.read = 1 - self.read;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn texel_size(&self) -> [f32; 2] {
        texel_size(self.width, self.height)
    }

    fn release<B: Backend + ?Sized>(&self, backend: &mut B) {
        for id in self.targets {
            backend.release_target(id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub sim: (u32, u32),
    pub dye: (u32, u32),
    pub bloom: (u32, u32),
    pub bloom_mips: Vec<(u32, u32)>,
    pub sunrays: (u32, u32),
}

impl FieldLayout {
    pub fn new(config: &FluidConfig, width: u32, height: u32) -> Self {
        let bloom = fit_resolution(config.bloom_resolution, width, height);
        let bloom_mips = (0..config.bloom_iterations)
            .map(|i| {
                (
                    bloom.0.checked_shr(i + 1).unwrap_or(0),
                    bloom.1.checked_shr(i + 1).unwrap_or(0),
                )
            })
            .take_while(|&(w, h)| w >= 2 && h >= 2)
            .collect();

        Self {
            sim: fit_resolution(config.sim_resolution, width, height),
            dye: fit_resolution(config.dye_resolution, width, height),
            bloom,
            bloom_mips,
            sunrays: fit_resolution(config.sunrays_resolution, width, height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldArena {
    pub velocity: DoubleField,
    pub dye: DoubleField,
    pub pressure: DoubleField,
    pub divergence: SingleField,
    pub curl: SingleField,
    pub bloom: SingleField,
    pub bloom_mips: Vec<SingleField>,
    pub sunrays: SingleField,
    pub sunrays_temp: SingleField,
}

impl FieldArena {
    pub fn allocate<B: Backend + ?Sized>(
        backend: &mut B,
        layout: &FieldLayout,
    ) -> Result<Self, BackendError> {
        debug!(
            "Allocating fields: sim {:?}, dye {:?}, bloom {:?} with {} mips, sunrays {:?}",
            layout.sim,
            layout.dye,
            layout.bloom,
            layout.bloom_mips.len(),
            layout.sunrays
        );
        Ok(Self {
            velocity: DoubleField::create(backend, &VELOCITY, layout.sim)?,
            dye: DoubleField::create(backend, &DYE, layout.dye)?,
            pressure: DoubleField::create(backend, &PRESSURE, layout.sim)?,
            divergence: SingleField::create(backend, &DIVERGENCE, layout.sim)?,
            curl: SingleField::create(backend, &CURL, layout.sim)?,
            bloom: SingleField::create(backend, &BLOOM, layout.bloom)?,
            bloom_mips: create_mips(backend, &layout.bloom_mips)?,
            sunrays: SingleField::create(backend, &SUNRAYS, layout.sunrays)?,
            sunrays_temp: SingleField::create(backend, &SUNRAYS, layout.sunrays)?,
        })
    }

    /// Brings every field to `layout`. Velocity and dye keep their content,
    /// resampled into the new size; the scratch fields come back zeroed.
    pub fn reallocate<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        programs: &ProgramSet,
        layout: &FieldLayout,
    ) -> Result<(), BackendError> {
        self.velocity = resize_preserving(backend, programs, self.velocity, &VELOCITY, layout.sim)?;
        self.dye = resize_preserving(backend, programs, self.dye, &DYE, layout.dye)?;

        if self.pressure.size() != layout.sim {
            self.pressure.release(backend);
            self.pressure = DoubleField::create(backend, &PRESSURE, layout.sim)?;
            self.divergence.release(backend);
            self.divergence = SingleField::create(backend, &DIVERGENCE, layout.sim)?;
            self.curl.release(backend);
            self.curl = SingleField::create(backend, &CURL, layout.sim)?;
        }

        if self.bloom.size() != layout.bloom {
            self.bloom.release(backend);
            self.bloom = SingleField::create(backend, &BLOOM, layout.bloom)?;
        }
        let mip_sizes: Vec<(u32, u32)> = self.bloom_mips.iter().map(SingleField::size).collect();
        if mip_sizes != layout.bloom_mips {
            for mip in &self.bloom_mips {
                mip.release(backend);
            }
            self.bloom_mips = create_mips(backend, &layout.bloom_mips)?;
        }

        if self.sunrays.size() != layout.sunrays {
            self.sunrays.release(backend);
            self.sunrays = SingleField::create(backend, &SUNRAYS, layout.sunrays)?;
            self.sunrays_temp.release(backend);
            self.sunrays_temp = SingleField::create(backend, &SUNRAYS, layout.sunrays)?;
        }

        debug!(
            "Fields now sim {:?}, dye {:?}, bloom mips {}",
            layout.sim,
            layout.dye,
            self.bloom_mips.len()
        );
        Ok(())
    }

    pub fn release<B: Backend + ?Sized>(&self, backend: &mut B) {
        self.velocity.release(backend);
        self.dye.release(backend);
        self.pressure.release(backend);
        self.divergence.release(backend);
        self.curl.release(backend);
        self.bloom.release(backend);
        for mip in &self.bloom_mips {
            mip.release(backend);
        }
        self.sunrays.release(backend);
        self.sunrays_temp.release(backend);
    }

    pub fn sim_size(&self) -> (u32, u32) {
        self.velocity.size()
    }

    pub fn dye_size(&self) -> (u32, u32) {
        self.dye.size()
    }
}

fn create_mips<B: Backend + ?Sized>(
    backend: &mut B,
    sizes: &[(u32, u32)],
) -> Result<Vec<SingleField>, BackendError> {
    sizes
        .iter()
        .map(|&size| SingleField::create(backend, &BLOOM, size))
        .collect()
}

fn resize_preserving<B: Backend + ?Sized>(
    backend: &mut B,
    programs: &ProgramSet,
    old: DoubleField,
    kind: &FieldKind,
    size: (u32, u32),
) -> Result<DoubleField, BackendError> {
    if old.size() == size {
        return Ok(old);
    }
    let resized = DoubleField::create(backend, kind, size)?;
    let pass = Pass::new(
        programs.copy,
        PassUniforms::with_texel(size.0, size.1),
        Target::Field(resized.read()),
    )
    .input(0, old.read());
    if let Err(err) = backend.draw(&pass) {
        resized.release(backend);
        return Err(err);
    }
    old.release(backend);
    Ok(resized)
}
