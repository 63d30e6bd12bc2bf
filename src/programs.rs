use bytemuck::{Pod, Zeroable};

use crate::capabilities::Capabilities;
use crate::config::FluidConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    Copy,
    Clear,
    Color,
    Splat,
    Advection,
    Curl,
    Vorticity,
    Divergence,
    Pressure,
    GradientSubtract,
    Display,
    BloomPrefilter,
    BloomBlur,
    BloomFinal,
    SunraysMask,
    Sunrays,
    Blur,
}

impl Program {
    pub const ALL: [Program; 17] = [
        Program::Copy,
        Program::Clear,
        Program::Color,
        Program::Splat,
        Program::Advection,
        Program::Curl,
        Program::Vorticity,
        Program::Divergence,
        Program::Pressure,
        Program::GradientSubtract,
        Program::Display,
        Program::BloomPrefilter,
        Program::BloomBlur,
        Program::BloomFinal,
        Program::SunraysMask,
        Program::Sunrays,
        Program::Blur,
    ];

    pub fn fragment_entry(self) -> &'static str {
        match self {
            Self::Copy => "fs_copy",
            Self::Clear => "fs_clear",
            Self::Color => "fs_color",
            Self::Splat => "fs_splat",
            Self::Advection => "fs_advection",
            Self::Curl => "fs_curl",
            Self::Vorticity => "fs_vorticity",
            Self::Divergence => "fs_divergence",
            Self::Pressure => "fs_pressure",
            Self::GradientSubtract => "fs_gradient_subtract",
            Self::Display => "fs_display",
            Self::BloomPrefilter => "fs_bloom_prefilter",
            Self::BloomBlur => "fs_bloom_blur",
            Self::BloomFinal => "fs_bloom_final",
            Self::SunraysMask => "fs_sunrays_mask",
            Self::Sunrays => "fs_sunrays",
            Self::Blur => "fs_blur",
        }
    }

    /// Programs that draw straight to a presentable image use a vertex stage
    /// that flips field space (y up) into image space (y down).
    pub fn vertex_entry(self) -> &'static str {
        match self {
            Self::Display | Self::Color => "vs_present",
            _ => "vs_main",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Keywords {
    pub manual_filtering: bool,
    pub shading: bool,
    pub bloom: bool,
    pub sunrays: bool,
}

impl Keywords {
    pub fn constants(self) -> [(&'static str, f64); 4] {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        [
            ("MANUAL_FILTERING", flag(self.manual_filtering)),
            ("SHADING", flag(self.shading)),
            ("BLOOM", flag(self.bloom)),
            ("SUNRAYS", flag(self.sunrays)),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramDesc {
    pub program: Program,
    pub keywords: Keywords,
}

impl ProgramDesc {
    const fn plain(program: Program) -> Self {
        Self {
            program,
            keywords: Keywords {
                manual_filtering: false,
                shading: false,
                bloom: false,
                sunrays: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSet {
    pub copy: ProgramDesc,
    pub clear: ProgramDesc,
    pub color: ProgramDesc,
    pub splat: ProgramDesc,
    pub advection: ProgramDesc,
    pub curl: ProgramDesc,
    pub vorticity: ProgramDesc,
    pub divergence: ProgramDesc,
    pub pressure: ProgramDesc,
    pub gradient_subtract: ProgramDesc,
    pub display: ProgramDesc,
    pub bloom_prefilter: ProgramDesc,
    pub bloom_blur: ProgramDesc,
    pub bloom_final: ProgramDesc,
    pub sunrays_mask: ProgramDesc,
    pub sunrays: ProgramDesc,
    pub blur: ProgramDesc,
}

impl ProgramSet {
    pub fn select(caps: &Capabilities, config: &FluidConfig) -> Self {
        let advection = ProgramDesc {
            program: Program::Advection,
            keywords: Keywords {
                manual_filtering: !caps.linear_filtering,
                ..Keywords::default()
            },
        };
        let display = ProgramDesc {
            program: Program::Display,
            keywords: Keywords {
                shading: config.shading,
                bloom: config.bloom,
                sunrays: config.sunrays,
                ..Keywords::default()
            },
        };

        Self {
            copy: ProgramDesc::plain(Program::Copy),
            clear: ProgramDesc::plain(Program::Clear),
            color: ProgramDesc::plain(Program::Color),
            splat: ProgramDesc::plain(Program::Splat),
            advection,
            curl: ProgramDesc::plain(Program::Curl),
            vorticity: ProgramDesc::plain(Program::Vorticity),
            divergence: ProgramDesc::plain(Program::Divergence),
            pressure: ProgramDesc::plain(Program::Pressure),
            gradient_subtract: ProgramDesc::plain(Program::GradientSubtract),
            display,
            bloom_prefilter: ProgramDesc::plain(Program::BloomPrefilter),
            bloom_blur: ProgramDesc::plain(Program::BloomBlur),
            bloom_final: ProgramDesc::plain(Program::BloomFinal),
            sunrays_mask: ProgramDesc::plain(Program::SunraysMask),
            sunrays: ProgramDesc::plain(Program::Sunrays),
            blur: ProgramDesc::plain(Program::Blur),
        }
    }

    pub fn all(&self) -> [ProgramDesc; 17] {
        [
            self.copy,
            self.clear,
            self.color,
            self.splat,
            self.advection,
            self.curl,
            self.vorticity,
            self.divergence,
            self.pressure,
            self.gradient_subtract,
            self.display,
            self.bloom_prefilter,
            self.bloom_blur,
            self.bloom_final,
            self.sunrays_mask,
            self.sunrays,
            self.blur,
        ]
    }
}

/// One uniform block shared by every program; each pass fills the fields it
/// reads and leaves the rest zeroed.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct PassUniforms {
    pub texel_size: [f32; 2],
    pub source_texel_size: [f32; 2],
    pub point: [f32; 2],
    pub direction: [f32; 2],
    pub color: [f32; 4],
    pub curve: [f32; 4],
    pub dt: f32,
    pub dissipation: f32,
    pub curl: f32,
    pub radius: f32,
    pub aspect_ratio: f32,
    pub value: f32,
    pub threshold: f32,
    pub _pad: [f32; 5],
}

// Keep host layout in sync with the WGSL `PassUniforms` struct.
const _: [(); 112] = [(); std::mem::size_of::<PassUniforms>()];

impl PassUniforms {
    pub fn with_texel(width: u32, height: u32) -> Self {
        Self {
            texel_size: texel_size(width, height),
            ..Self::default()
        }
    }
}

pub fn texel_size(width: u32, height: u32) -> [f32; 2] {
    [1.0 / width.max(1) as f32, 1.0 / height.max(1) as f32]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_filtering_follows_capabilities() {
        let config = FluidConfig::default();
        let full = ProgramSet::select(&Capabilities::full_float(), &config);
        assert!(!full.advection.keywords.manual_filtering);

        let caps = Capabilities {
            linear_filtering: false,
            ..Capabilities::full_float()
        };
        let degraded = ProgramSet::select(&caps, &config);
        assert!(degraded.advection.keywords.manual_filtering);
    }

    #[test]
    fn display_keywords_follow_config() {
        let config = FluidConfig {
            bloom: false,
            ..FluidConfig::default()
        };
        let set = ProgramSet::select(&Capabilities::full_float(), &config);
        assert!(set.display.keywords.shading);
        assert!(!set.display.keywords.bloom);
        assert!(set.display.keywords.sunrays);
    }

    #[test]
    fn registry_covers_every_program_once() {
        let set = ProgramSet::select(&Capabilities::full_float(), &FluidConfig::default());
        let programs: Vec<Program> = set.all().iter().map(|d| d.program).collect();
        assert_eq!(programs, Program::ALL.to_vec());
    }
}
