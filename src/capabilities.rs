use log::{info, warn};
use wgpu::TextureFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiTier {
    Modern,
    Compatibility,
}

impl ApiTier {
    pub fn from_backend(backend: wgpu::Backend) -> Self {
        match backend {
            wgpu::Backend::Gl => Self::Compatibility,
            _ => Self::Modern,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channels {
    R,
    Rg,
    Rgba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelType {
    Half,
    Byte,
}

impl TexelType {
    pub fn of(format: TextureFormat) -> Self {
        match format {
            TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
                Self::Half
            }
            _ => Self::Byte,
        }
    }
}

const R_CHAIN: &[TextureFormat] = &[
    TextureFormat::R16Float,
    TextureFormat::Rg16Float,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
];
const RG_CHAIN: &[TextureFormat] = &[
    TextureFormat::Rg16Float,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
];
const RGBA_CHAIN: &[TextureFormat] = &[TextureFormat::Rgba16Float, TextureFormat::Rgba8Unorm];

pub fn format_chain(tier: ApiTier, channels: Channels) -> &'static [TextureFormat] {
    match (tier, channels) {
        (ApiTier::Compatibility, _) | (_, Channels::Rgba) => RGBA_CHAIN,
        (ApiTier::Modern, Channels::Rg) => RG_CHAIN,
        (ApiTier::Modern, Channels::R) => R_CHAIN,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSupport {
    Found(TextureFormat),
    Unsupported,
}

/// Answers whether a format works as a render target and whether it can be
/// sampled with linear filtering. The wgpu implementation checks by actually
/// rendering into a tiny texture.
pub trait FormatProbe {
    fn supports_render_target(&self, format: TextureFormat) -> bool;
    fn supports_linear_filtering(&self, format: TextureFormat) -> bool;
}

pub fn resolve_format<P: FormatProbe + ?Sized>(chain: &[TextureFormat], probe: &P) -> FormatSupport {
    chain
        .iter()
        .copied()
        .find(|&format| probe.supports_render_target(format))
        .map_or(FormatSupport::Unsupported, FormatSupport::Found)
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("no usable rendering context on any backend")]
    NoAdapter,
    #[error("failed to open rendering device: {0}")]
    NoDevice(#[from] wgpu::RequestDeviceError),
    #[error("failed to create window surface: {0}")]
    Surface(String),
    #[error("no renderable texture format for {0:?} fields")]
    UnsupportedFormat(Channels),
    #[error("shader program failed to compile: {0}")]
    Shader(String),
    #[error("failed to allocate field buffers: {0}")]
    Target(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub tier: ApiTier,
    pub rgba: TextureFormat,
    pub rg: TextureFormat,
    pub r: TextureFormat,
    pub half_float: TexelType,
    pub linear_filtering: bool,
}

impl Capabilities {
    pub fn negotiate<P: FormatProbe + ?Sized>(tier: ApiTier, probe: &P) -> Result<Self, InitError> {
        let resolve = |channels| match resolve_format(format_chain(tier, channels), probe) {
            FormatSupport::Found(format) => Ok(format),
            FormatSupport::Unsupported => Err(InitError::UnsupportedFormat(channels)),
        };
        let rgba = resolve(Channels::Rgba)?;
        let rg = resolve(Channels::Rg)?;
        let r = resolve(Channels::R)?;
        let linear_filtering = probe.supports_linear_filtering(rgba);

        let caps = Self {
            tier,
            rgba,
            rg,
            r,
            half_float: TexelType::of(rgba),
            linear_filtering,
        };
        info!(
            "Negotiated {:?} context: rgba={:?} rg={:?} r={:?} linear_filtering={}",
            tier, rgba, rg, r, linear_filtering
        );
        if !linear_filtering {
            warn!("Linear filtering unavailable; dye resolution and effects will be reduced");
        }
        Ok(caps)
    }

    pub fn full_float() -> Self {
        Self {
            tier: ApiTier::Modern,
            rgba: TextureFormat::Rgba16Float,
            rg: TextureFormat::Rg16Float,
            r: TextureFormat::R16Float,
            half_float: TexelType::Half,
            linear_filtering: true,
        }
    }

    pub fn format(&self, channels: Channels) -> TextureFormat {
        match channels {
            Channels::R => self.r,
            Channels::Rg => self.rg,
            Channels::Rgba => self.rgba,
        }
    }
}
