use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use half::f16;
use log::{debug, error, info, warn};
use wgpu::TextureFormat;
use winit::window::Window;

use super::{Backend, BackendError, Blend, Filter, Pass, Target, TargetDesc, TargetFormat, TargetId};
use crate::capabilities::{ApiTier, Capabilities, FormatProbe, InitError};
use crate::programs::{PassUniforms, Program, ProgramDesc, ProgramSet};

const SHADER_SOURCE: &str = include_str!("../../shaders/fluid.wgsl");

const UNIFORM_SLOTS: u64 = 256;

const PROBE_SIZE: u32 = 4;

struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: TextureFormat,
    filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    desc: ProgramDesc,
    format: TextureFormat,
    blend: Blend,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    caps: Capabilities,

    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    placeholder: wgpu::TextureView,

    uniform_buffer: wgpu::Buffer,
    uniform_stride: u64,
    uniform_staging: Vec<u8>,
    uniform_cursor: u64,

    targets: Vec<Option<GpuTarget>>,
    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    frame_cleared: bool,
}

impl GpuBackend {
    pub async fn new(window: Arc<Window>) -> Result<Self, InitError> {
        let size = window.inner_size();
        let (surface, adapter) = open_surface(window).await?;

        let adapter_info = adapter.get_info();
        let tier = ApiTier::from_backend(adapter_info.backend);
        info!(
            "Using adapter {} on {:?} ({:?} tier)",
            adapter_info.name, adapter_info.backend, tier
        );

        let base_limits = match tier {
            ApiTier::Modern => wgpu::Limits::default(),
            ApiTier::Compatibility => wgpu::Limits::downlevel_webgl2_defaults(),
        };
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: base_limits.using_resolution(adapter.limits()),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;
        device.on_uncaptured_error(Box::new(|err| error!("Uncaptured GPU error: {err}")));

        let caps = Capabilities::negotiate(
            tier,
            &DeviceProbe {
                adapter: &adapter,
                device: &device,
                queue: &queue,
            },
        )?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| InitError::Surface("surface reports no formats".to_string()))?;
        let alpha_mode = if surface_caps
            .alpha_modes
            .contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            wgpu::CompositeAlphaMode::Auto
        };
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fluid Shaders"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });
        if let Some(err) = device.pop_error_scope().await {
            return Err(InitError::Shader(err.to_string()));
        }

        let bind_group_layout = create_bind_group_layout(&device, caps.linear_filtering);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let sampler = |label, filter| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let linear_sampler = sampler("Linear Sampler", wgpu::FilterMode::Linear);
        let nearest_sampler = sampler("Nearest Sampler", wgpu::FilterMode::Nearest);

        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Empty Input"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let uniform_stride = (std::mem::size_of::<PassUniforms>() as u64).div_ceil(alignment) * alignment;
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pass Uniforms"),
            size: uniform_stride * UNIFORM_SLOTS,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            caps,
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            linear_sampler,
            nearest_sampler,
            placeholder,
            uniform_buffer,
            uniform_stride,
            uniform_staging: vec![0; (uniform_stride * UNIFORM_SLOTS) as usize],
            uniform_cursor: 0,
            targets: Vec::new(),
            encoder: None,
            frame: None,
            frame_cleared: false,
        })
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) {
        if self.pipelines.contains_key(&key) {
            return;
        }
        let constants: HashMap<String, f64> = key
            .desc
            .keywords
            .constants()
            .iter()
            .map(|&(name, value)| (name.to_string(), value))
            .collect();
        let program = key.desc.program;
        debug!("Compiling {} for {:?} ({:?})", program.fragment_entry(), key.format, key.blend);

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.fragment_entry()),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.shader,
                entry_point: program.vertex_entry(),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.shader,
                entry_point: program.fragment_entry(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: key.format,
                    blend: blend_state(key.blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        self.pipelines.insert(key, pipeline);
    }

    fn prepared_outputs(&self, program: Program) -> Vec<(TextureFormat, Blend)> {
        let caps = &self.caps;
        let screen = self.surface_config.format;
        match program {
            Program::Copy | Program::Splat | Program::Advection => {
                vec![(caps.rg, Blend::Replace), (caps.rgba, Blend::Replace)]
            }
            Program::Clear => vec![(caps.r, Blend::Replace), (caps.rgba, Blend::Replace)],
            Program::Curl
            | Program::Divergence
            | Program::Pressure
            | Program::Sunrays
            | Program::Blur => vec![(caps.r, Blend::Replace)],
            Program::Vorticity | Program::GradientSubtract => vec![(caps.rg, Blend::Replace)],
            Program::BloomPrefilter | Program::BloomFinal | Program::SunraysMask => {
                vec![(caps.rgba, Blend::Replace)]
            }
            Program::BloomBlur => vec![(caps.rgba, Blend::Replace), (caps.rgba, Blend::Additive)],
            Program::Color => vec![(screen, Blend::Replace), (TextureFormat::Rgba8Unorm, Blend::Replace)],
            Program::Display => vec![
                (screen, Blend::Premultiplied),
                (screen, Blend::Replace),
                (TextureFormat::Rgba8Unorm, Blend::Premultiplied),
                (TextureFormat::Rgba8Unorm, Blend::Replace),
            ],
        }
    }

    fn sampler_for(&self, filter: Filter) -> &wgpu::Sampler {
        if filter == Filter::Linear && self.caps.linear_filtering {
            &self.linear_sampler
        } else {
            &self.nearest_sampler
        }
    }

    fn bind_group(&self, pass: &Pass) -> Result<wgpu::BindGroup, BackendError> {
        let mut views = [&self.placeholder; 3];
        let mut samplers = [&self.nearest_sampler; 3];
        for (slot, id) in pass.inputs.iter().enumerate() {
            if let Some(id) = id {
                let target = lookup(&self.targets, *id)?;
                views[slot] = &target.view;
                samplers[slot] = self.sampler_for(target.filter);
            }
        }

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(pass.desc.program.fragment_entry()),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: NonZeroU64::new(std::mem::size_of::<PassUniforms>() as u64),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(views[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(views[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(views[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(samplers[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(samplers[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::Sampler(samplers[2]),
                },
            ],
        }))
    }

    fn push_uniforms(&mut self, uniforms: &PassUniforms) -> u32 {
        if self.uniform_cursor == UNIFORM_SLOTS {
            self.flush();
        }
        let start = (self.uniform_cursor * self.uniform_stride) as usize;
        let bytes = bytemuck::bytes_of(uniforms);
        self.uniform_staging[start..start + bytes.len()].copy_from_slice(bytes);
        self.uniform_cursor += 1;
        start as u32
    }

    /// Uploads staged uniforms and submits recorded passes. Uploads land
    /// before the submitted commands run.
    fn flush(&mut self) {
        if self.uniform_cursor > 0 {
            let used = (self.uniform_cursor * self.uniform_stride) as usize;
            self.queue
                .write_buffer(&self.uniform_buffer, 0, &self.uniform_staging[..used]);
            self.uniform_cursor = 0;
        }
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn acquire_frame(&mut self) -> Result<(), BackendError> {
        if self.frame.is_some() {
            return Ok(());
        }
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                warn!("Surface lost; reconfiguring");
                self.surface.configure(&self.device, &self.surface_config);
                self.surface
                    .get_current_texture()
                    .map_err(|err| BackendError::Surface(err.to_string()))?
            }
            Err(err) => return Err(BackendError::Surface(err.to_string())),
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.frame = Some((frame, view));
        self.frame_cleared = false;
        Ok(())
    }
}

impl Backend for GpuBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == self.surface_size() {
            return;
        }
        self.frame = None;
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
    }

    fn prepare(&mut self, programs: &ProgramSet) -> Result<(), InitError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        for desc in programs.all() {
            for (format, blend) in self.prepared_outputs(desc.program) {
                self.ensure_pipeline(PipelineKey { desc, format, blend });
            }
        }
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(InitError::Shader(err.to_string()));
        }
        info!("Prepared {} pipelines", self.pipelines.len());
        Ok(())
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError> {
        let format = match desc.format {
            TargetFormat::Field(channels) => self.caps.format(channels),
            TargetFormat::Rgba8 => TextureFormat::Rgba8Unorm,
        };
        let max_side = self.device.limits().max_texture_dimension_2d;
        let width = desc.width.clamp(1, max_side);
        let height = desc.height.clamp(1, max_side);

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let target = GpuTarget {
            texture,
            view,
            width,
            height,
            format,
            filter: desc.filter,
        };

        let index = match self.targets.iter().position(Option::is_none) {
            Some(index) => {
                self.targets[index] = Some(target);
                index
            }
            None => {
                self.targets.push(Some(target));
                self.targets.len() - 1
            }
        };
        debug!("Created {} {}x{} {:?} as slot {}", desc.label, width, height, format, index);
        Ok(TargetId(index as u32))
    }

    fn release_target(&mut self, id: TargetId) {
        if let Some(slot) = self.targets.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    fn draw(&mut self, pass: &Pass) -> Result<(), BackendError> {
        if let (true, Target::Field(id)) = (pass.aliases_output(), pass.target) {
            return Err(BackendError::AliasedPass(id));
        }
        let format = match pass.target {
            Target::Field(id) => lookup(&self.targets, id)?.format,
            Target::Screen => {
                self.acquire_frame()?;
                self.surface_config.format
            }
        };

        let key = PipelineKey {
            desc: pass.desc,
            format,
            blend: pass.blend,
        };
        self.ensure_pipeline(key);
        let bind_group = self.bind_group(pass)?;
        let offset = self.push_uniforms(&pass.uniforms);

        let load = match pass.target {
            Target::Screen if !self.frame_cleared => {
                self.frame_cleared = true;
                wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
            }
            _ => wgpu::LoadOp::Load,
        };
        let view = match pass.target {
            Target::Field(id) => &lookup(&self.targets, id)?.view,
            Target::Screen => match &self.frame {
                Some((_, view)) => view,
                None => return Err(BackendError::Surface("no surface image acquired".to_string())),
            },
        };
        let pipeline = &self.pipelines[&key];
        let encoder = self.encoder.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Fluid Passes"),
                })
        });

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(pass.desc.program.fragment_entry()),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(pipeline);
        render_pass.set_bind_group(0, &bind_group, &[offset]);
        render_pass.draw(0..3, 0..1);
        Ok(())
    }

    fn submit(&mut self) {
        self.flush();
        if let Some((frame, view)) = self.frame.take() {
            drop(view);
            frame.present();
        }
    }

    fn read_target(&mut self, id: TargetId) -> Result<Vec<[f32; 4]>, BackendError> {
        self.flush();
        let target = lookup(&self.targets, id)?;
        let (channels, channel_bytes) = match target.format {
            TextureFormat::R16Float => (1, 2),
            TextureFormat::Rg16Float => (2, 2),
            TextureFormat::Rgba16Float => (4, 2),
            TextureFormat::Rgba8Unorm => (4, 1),
            other => return Err(BackendError::Unreadable(other)),
        };
        let (width, height) = (target.width, target.height);
        let unpadded = width * channels * channel_bytes;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Read") });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(BackendError::Readback(err.to_string())),
            None => return Err(BackendError::Readback("map callback dropped".to_string())),
        }

        let data = slice.get_mapped_range();
        let stride = (channels * channel_bytes) as usize;
        let mut texels = Vec::with_capacity((width * height) as usize);
        for row in data.chunks(padded as usize).take(height as usize) {
            for texel in row[..unpadded as usize].chunks_exact(stride) {
                let mut value = [0.0, 0.0, 0.0, 1.0];
                for (c, bytes) in texel.chunks_exact(channel_bytes as usize).enumerate() {
                    value[c] = match bytes {
                        [lo, hi] => f16::from_le_bytes([*lo, *hi]).to_f32(),
                        [byte] => f32::from(*byte) / 255.0,
                        _ => 0.0,
                    };
                }
                texels.push(value);
            }
        }
        drop(data);
        staging.unmap();
        Ok(texels)
    }

    fn release_all(&mut self) {
        self.encoder = None;
        self.frame = None;
        self.uniform_cursor = 0;
        self.targets.clear();
        self.pipelines.clear();
    }
}

fn lookup(targets: &[Option<GpuTarget>], id: TargetId) -> Result<&GpuTarget, BackendError> {
    targets
        .get(id.0 as usize)
        .and_then(Option::as_ref)
        .ok_or(BackendError::UnknownTarget(id))
}

fn blend_state(blend: Blend) -> Option<wgpu::BlendState> {
    match blend {
        Blend::Replace => None,
        Blend::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            Some(wgpu::BlendState {
                color: add,
                alpha: add,
            })
        }
        Blend::Premultiplied => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
    }
}

fn create_bind_group_layout(device: &wgpu::Device, filterable: bool) -> wgpu::BindGroupLayout {
    let texture = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };
    let sampler = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(if filterable {
            wgpu::SamplerBindingType::Filtering
        } else {
            wgpu::SamplerBindingType::NonFiltering
        }),
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Fluid Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<PassUniforms>() as u64),
                },
                count: None,
            },
            texture(1),
            texture(2),
            texture(3),
            sampler(4),
            sampler(5),
            sampler(6),
        ],
    })
}

async fn open_surface(
    window: Arc<Window>,
) -> Result<(wgpu::Surface<'static>, wgpu::Adapter), InitError> {
    let mut surface_error = None;
    for backends in [wgpu::Backends::PRIMARY, wgpu::Backends::GL] {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let surface = match instance.create_surface(window.clone()) {
            Ok(surface) => surface,
            Err(err) => {
                warn!("No surface on {:?}: {}", backends, err);
                surface_error = Some(err.to_string());
                continue;
            }
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await;
        match adapter {
            Some(adapter) => return Ok((surface, adapter)),
            None => warn!("No adapter on {:?}", backends),
        }
    }
    Err(surface_error.map_or(InitError::NoAdapter, InitError::Surface))
}

/// Tests render-target support by clearing a tiny texture inside an error
/// scope, so drivers that advertise a format but reject it are caught.
struct DeviceProbe<'a> {
    adapter: &'a wgpu::Adapter,
    device: &'a wgpu::Device,
    queue: &'a wgpu::Queue,
}

impl FormatProbe for DeviceProbe<'_> {
    fn supports_render_target(&self, format: TextureFormat) -> bool {
        let required = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        if !self
            .adapter
            .get_texture_format_features(format)
            .allowed_usages
            .contains(required)
        {
            debug!("{:?} is not renderable on this adapter", format);
            return false;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Format Probe"),
            size: wgpu::Extent3d {
                width: PROBE_SIZE,
                height: PROBE_SIZE,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: required,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Probe") });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Probe Clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => {
                debug!("{:?} rejected as render target: {}", format, err);
                false
            }
            None => true,
        }
    }

    fn supports_linear_filtering(&self, format: TextureFormat) -> bool {
        self.adapter
            .get_texture_format_features(format)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::Keywords;
    use naga::valid::{Capabilities as ShaderCapabilities, ValidationFlags, Validator};

    fn parsed_shader() -> naga::Module {
        naga::front::wgsl::parse_str(SHADER_SOURCE)
            .unwrap_or_else(|err| panic!("{}", err.emit_to_string(SHADER_SOURCE)))
    }

    #[test]
    fn shader_validates() {
        let module = parsed_shader();
        Validator::new(ValidationFlags::all(), ShaderCapabilities::all())
            .validate(&module)
            .unwrap_or_else(|err| panic!("shader failed validation: {err:?}"));
    }

    #[test]
    fn every_program_has_its_entry_points() {
        let module = parsed_shader();
        let entry = |name: &str, stage: naga::ShaderStage| {
            module
                .entry_points
                .iter()
                .any(|ep| ep.name == name && ep.stage == stage)
        };
        for program in Program::ALL {
            assert!(
                entry(program.vertex_entry(), naga::ShaderStage::Vertex),
                "{program:?} is missing vertex entry {}",
                program.vertex_entry()
            );
            assert!(
                entry(program.fragment_entry(), naga::ShaderStage::Fragment),
                "{program:?} is missing fragment entry {}",
                program.fragment_entry()
            );
        }
    }

    #[test]
    fn keywords_and_uniforms_match_the_shader() {
        let module = parsed_shader();
        for (name, _) in Keywords::default().constants() {
            assert!(
                module
                    .overrides
                    .iter()
                    .any(|(_, o)| o.name.as_deref() == Some(name)),
                "shader has no override named {name}"
            );
        }

        let span = module
            .types
            .iter()
            .find_map(|(_, ty)| match ty.inner {
                naga::TypeInner::Struct { span, .. } if ty.name.as_deref() == Some("PassUniforms") => Some(span),
                _ => None,
            })
            .expect("PassUniforms struct");
        assert_eq!(span as usize, std::mem::size_of::<PassUniforms>());
    }
}
