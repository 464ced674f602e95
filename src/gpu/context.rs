//! wgpu backend.
//!
//! [`GpuContext`] owns a headless wgpu device and implements [`GpuBackend`] on
//! top of it. Commands are recorded into one pending [`wgpu::CommandEncoder`]
//! and submitted on [`flush`](GpuBackend::flush) or when a fence is inserted.
//!
//! # Example
//!
//! ```no_run
//! use feedloop::{GpuContext, GpuBackend};
//!
//! let mut gpu = GpuContext::headless()?;
//! println!("rendering on {}", gpu.adapter_name());
//! gpu.flush();
//! # Ok::<(), feedloop::FeedError>(())
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use wgpu::util::DeviceExt;

use super::{
    DrawCall, FilterMode, GpuBackend, PixelFormat, ProgramDesc, ProgramLayout, RawBuffer,
    RawFence, RawProgram, RawTexture, TextureDesc,
};
use crate::error::{FeedError, FeedResult, GpuError, GpuResult};

const BLIT_SHADER: &str = r#"
@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var src_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
}

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> VertexOutput {
    let uv = vec2f(f32((vi << 1u) & 2u), f32(vi & 2u));
    var out: VertexOutput;
    out.position = vec4f(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2f(uv.x, 1.0 - uv.y);
    return out;
}

@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    return textureSampleLevel(src, src_sampler, in.uv, 0.0);
}
"#;

const FORMATS: [PixelFormat; 2] = [PixelFormat::Rgba8Unorm, PixelFormat::Rgba16Float];

fn wgpu_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

fn format_index(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Rgba8Unorm => 0,
        PixelFormat::Rgba16Float => 1,
    }
}

fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

struct GpuTexture {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    layers: u32,
    format: PixelFormat,
    /// One 2D view per layer, used as render attachment and `texture_2d` binding.
    layer_views: Vec<wgpu::TextureView>,
    /// Whole-texture `texture_2d_array` view.
    array_view: wgpu::TextureView,
}

struct GpuProgram {
    layout: ProgramLayout,
    /// One pipeline per [`PixelFormat`], indexed by [`format_index`].
    pipelines: Vec<wgpu::RenderPipeline>,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
    /// Completion flag of the last copy into this buffer.
    pending: Option<Arc<AtomicBool>>,
    copied: bool,
}

/// Headless wgpu device implementing [`GpuBackend`].
///
/// The device and queue are public so callers can create their own resources
/// next to the compositor's.
pub struct GpuContext {
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
    adapter_name: String,
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u64,
    textures: HashMap<u64, GpuTexture>,
    programs: HashMap<u64, GpuProgram>,
    buffers: HashMap<u64, GpuBuffer>,
    fences: HashMap<u64, Arc<AtomicBool>>,
    single_layout: wgpu::BindGroupLayout,
    layered_layout: wgpu::BindGroupLayout,
    blit_layout: wgpu::BindGroupLayout,
    blit_pipelines: Vec<wgpu::RenderPipeline>,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    zero_view: wgpu::TextureView,
    zero_array_view: wgpu::TextureView,
}

impl GpuContext {
    /// Create a context on the default adapter without a surface.
    ///
    /// This performs all wgpu initialization:
    /// 1. Creates a wgpu instance with primary backends
    /// 2. Requests an adapter, no compatible surface required
    /// 3. Creates the logical device and command queue
    /// 4. Builds the shared bind group layouts, samplers and blit pipelines
    ///
    /// Failing here is the one unrecoverable error: nothing can render.
    pub fn headless() -> FeedResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| FeedError::context(format!("no suitable GPU adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("feedloop device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| FeedError::context(format!("device creation failed: {e}")))?;

        let adapter_name = adapter.get_info().name;
        tracing::info!(adapter = %adapter_name, "gpu context created");
        Ok(Self::from_device(device, queue, adapter_name))
    }

    fn from_device(device: wgpu::Device, queue: wgpu::Queue, adapter_name: String) -> Self {
        let uniform_entry = wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let texture_entry = |binding, view_dimension| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension,
                multisampled: false,
            },
            count: None,
        };
        let sampler_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };

        let single_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Single Input Layout"),
            entries: &[
                uniform_entry,
                texture_entry(1, wgpu::TextureViewDimension::D2),
                sampler_entry(2),
                texture_entry(3, wgpu::TextureViewDimension::D2),
            ],
        });
        let layered_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Layered Input Layout"),
            entries: &[
                uniform_entry,
                texture_entry(1, wgpu::TextureViewDimension::D2Array),
                sampler_entry(2),
            ],
        });
        let blit_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Blit Layout"),
            entries: &[
                texture_entry(0, wgpu::TextureViewDimension::D2),
                sampler_entry(1),
            ],
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

        let zero = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Zero Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let zero_view = zero.create_view(&wgpu::TextureViewDescriptor::default());
        let zero_array_view = zero.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });

        let blit_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });
        let blit_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&blit_layout],
            push_constant_ranges: &[],
        });
        let blit_pipelines = FORMATS
            .iter()
            .map(|&format| {
                fullscreen_pipeline(
                    &device,
                    "Blit Pipeline",
                    &blit_pipeline_layout,
                    &blit_module,
                    &blit_module,
                    format,
                )
            })
            .collect();

        Self {
            device,
            queue,
            adapter_name,
            encoder: None,
            next_id: 1,
            textures: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            fences: HashMap::new(),
            single_layout,
            layered_layout,
            blit_layout,
            blit_pipelines,
            linear_sampler,
            nearest_sampler,
            zero_view,
            zero_array_view,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("feedloop encoder"),
                })
        })
    }

    fn texture(&self, texture: RawTexture) -> GpuResult<&GpuTexture> {
        self.textures
            .get(&texture.0)
            .ok_or(GpuError::UnknownResource {
                kind: "texture",
                id: texture.0,
            })
    }

    fn layer_view(&self, texture: RawTexture, layer: u32) -> GpuResult<&wgpu::TextureView> {
        let tex = self.texture(texture)?;
        tex.layer_views.get(layer as usize).ok_or_else(|| {
            GpuError::device(format!(
                "layer {layer} out of range for texture {} with {} layers",
                texture.0, tex.layers
            ))
        })
    }

    fn sampler(&self, filter: FilterMode) -> &wgpu::Sampler {
        match filter {
            FilterMode::Linear => &self.linear_sampler,
            FilterMode::Nearest => &self.nearest_sampler,
        }
    }

    /// Record a fullscreen blit render pass from one layer into another.
    fn blit_pass(
        &mut self,
        src: RawTexture,
        src_layer: u32,
        dst: RawTexture,
        dst_layer: u32,
    ) -> GpuResult<()> {
        let format = self.texture(dst)?.format;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &self.blit_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(
                        self.layer_view(src, src_layer)?,
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.nearest_sampler),
                },
            ],
        });
        let target = self.layer_view(dst, dst_layer)?.clone();
        let pipeline = self.blit_pipelines[format_index(format)].clone();
        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Blit Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn submit_pending(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
    }

    /// Run `create` inside a validation error scope and report what it caught.
    fn validated<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }
}

fn fullscreen_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    format: PixelFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("vs"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("fs"),
            targets: &[Some(wgpu::ColorTargetState {
                format: wgpu_format(format),
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

impl GpuBackend for GpuContext {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<RawTexture> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(GpuError::allocation(desc.label, "zero-sized texture"));
        }
        let limits = self.device.limits();
        if desc.width > limits.max_texture_dimension_2d
            || desc.height > limits.max_texture_dimension_2d
            || desc.layers > limits.max_texture_array_layers
        {
            return Err(GpuError::allocation(
                desc.label,
                format!(
                    "{}x{}x{} exceeds device limits",
                    desc.width, desc.height, desc.layers
                ),
            ));
        }

        let texture = self
            .validated(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(desc.label),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: desc.layers,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format(desc.format),
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .map_err(|message| GpuError::allocation(desc.label, message))?;

        let layer_views = (0..desc.layers)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(desc.label),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        let array_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });

        let id = self.alloc_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
                format: desc.format,
                layer_views,
                array_view,
            },
        );
        Ok(RawTexture(id))
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        // Dropping is enough; wgpu keeps the texture alive until queued work using it completes.
        self.textures.remove(&texture.0);
    }

    fn clear(&mut self, texture: RawTexture, layer: u32, color: [f32; 4]) -> GpuResult<()> {
        let view = self.layer_view(texture, layer)?.clone();
        let [r, g, b, a] = color.map(f64::from);
        let encoder = self.encoder();
        let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        Ok(())
    }

    fn blit(
        &mut self,
        src: RawTexture,
        src_layer: u32,
        dst: RawTexture,
        dst_layer: u32,
    ) -> GpuResult<()> {
        let (source, target) = (self.texture(src)?, self.texture(dst)?);
        let same_shape = (source.width, source.height, source.format)
            == (target.width, target.height, target.format);
        if src_layer >= source.layers || dst_layer >= target.layers {
            return Err(GpuError::device("blit layer out of range"));
        }
        if src == dst && src_layer == dst_layer {
            return Ok(());
        }
        if !same_shape {
            return self.blit_pass(src, src_layer, dst, dst_layer);
        }

        let (src_tex, dst_tex) = (source.texture.clone(), target.texture.clone());
        let size = wgpu::Extent3d {
            width: source.width,
            height: source.height,
            depth_or_array_layers: 1,
        };
        self.encoder().copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &src_tex,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: src_layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &dst_tex,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: dst_layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            size,
        );
        Ok(())
    }

    fn upload_rgba8(&mut self, texture: RawTexture, layer: u32, pixels: &[u8]) -> GpuResult<()> {
        let tex = self.texture(texture)?;
        let (width, height, format) = (tex.width, tex.height, tex.format);
        if layer >= tex.layers {
            return Err(GpuError::device("upload layer out of range"));
        }
        if pixels.len() != width as usize * height as usize * 4 {
            return Err(GpuError::FormatMismatch(format!(
                "upload of {} bytes into a {width}x{height} texture",
                pixels.len()
            )));
        }
        // Queue writes land before the next submission, so submit earlier work first.
        self.submit_pending();

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let layout = wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        };
        if format == PixelFormat::Rgba8Unorm {
            let dst = self.texture(texture)?.texture.clone();
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &dst,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                pixels,
                layout,
                size,
            );
            return Ok(());
        }

        // Other formats: stage through an RGBA8 texture and convert with a blit.
        let staging = self.create_texture(&TextureDesc {
            label: "upload staging",
            width,
            height,
            layers: 1,
            layered: false,
            format: PixelFormat::Rgba8Unorm,
        })?;
        let result = self
            .upload_rgba8(staging, 0, pixels)
            .and_then(|()| self.blit_pass(staging, 0, texture, layer));
        self.destroy_texture(staging);
        result
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> GpuResult<RawProgram> {
        let bind_layout = match desc.layout {
            ProgramLayout::Single => &self.single_layout,
            ProgramLayout::Layered => &self.layered_layout,
        };
        let pipelines = self
            .validated(|device| {
                let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(desc.label),
                    source: wgpu::ShaderSource::Wgsl(desc.vertex.into()),
                });
                let fragment = if desc.fragment == desc.vertex {
                    vertex.clone()
                } else {
                    device.create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(desc.label),
                        source: wgpu::ShaderSource::Wgsl(desc.fragment.into()),
                    })
                };
                let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(desc.label),
                    bind_group_layouts: &[bind_layout],
                    push_constant_ranges: &[],
                });
                FORMATS
                    .iter()
                    .map(|&format| {
                        fullscreen_pipeline(device, desc.label, &layout, &vertex, &fragment, format)
                    })
                    .collect::<Vec<_>>()
            })
            .map_err(|message| GpuError::shader_link(desc.label, message))?;

        let id = self.alloc_id();
        self.programs.insert(
            id,
            GpuProgram {
                layout: desc.layout,
                pipelines,
            },
        );
        tracing::debug!(label = desc.label, "program linked");
        Ok(RawProgram(id))
    }

    fn destroy_program(&mut self, program: RawProgram) {
        self.programs.remove(&program.0);
    }

    fn draw(&mut self, call: &DrawCall) -> GpuResult<()> {
        if call.input == Some(call.target) || call.previous == Some(call.target) {
            return Err(GpuError::device(
                "draw target is also bound as a sampled input",
            ));
        }
        let program = self
            .programs
            .get(&call.program.0)
            .ok_or(GpuError::UnknownResource {
                kind: "program",
                id: call.program.0,
            })?;
        let target = self.texture(call.target)?;
        let pipeline = program.pipelines[format_index(target.format)].clone();
        let target_view = target.layer_views[0].clone();

        // Uniform blocks must be a multiple of 16 bytes.
        let mut uniforms = call.uniforms.to_vec();
        uniforms.resize(uniforms.len().div_ceil(16).max(1) * 16, 0);
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Operation Uniforms"),
                contents: &uniforms,
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let sampler = self.sampler(call.filter);
        let bind_group = match program.layout {
            ProgramLayout::Single => {
                let input = match call.input {
                    Some(tex) => self.layer_view(tex, 0)?,
                    None => &self.zero_view,
                };
                let previous = match call.previous {
                    Some(tex) => self.layer_view(tex, 0)?,
                    None => input,
                };
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Single Input Bind Group"),
                    layout: &self.single_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: uniform_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(input),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::TextureView(previous),
                        },
                    ],
                })
            }
            ProgramLayout::Layered => {
                let layers = match call.input {
                    Some(tex) => &self.texture(tex)?.array_view,
                    None => &self.zero_array_view,
                };
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Layered Input Bind Group"),
                    layout: &self.layered_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: uniform_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(layers),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        },
                    ],
                })
            }
        };

        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Operation Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target_view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn create_readback_buffer(&mut self, width: u32, height: u32) -> GpuResult<RawBuffer> {
        let padded_row = padded_bytes_per_row(width);
        let buffer = self
            .validated(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Readback Buffer"),
                    size: padded_row as u64 * height as u64,
                    usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                    mapped_at_creation: false,
                })
            })
            .map_err(|message| GpuError::allocation("readback buffer", message))?;
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                width,
                height,
                padded_row,
                pending: None,
                copied: false,
            },
        );
        Ok(RawBuffer(id))
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        self.buffers.remove(&buffer.0);
    }

    fn copy_to_buffer(&mut self, texture: RawTexture, buffer: RawBuffer) -> GpuResult<()> {
        let tex = self.texture(texture)?;
        if !tex.format.is_host_readable() {
            return Err(GpuError::FormatMismatch(format!(
                "cannot copy {:?} texture into an RGBA8 buffer",
                tex.format
            )));
        }
        let (width, height, src) = (tex.width, tex.height, tex.texture.clone());
        let buf = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(GpuError::UnknownResource {
                kind: "buffer",
                id: buffer.0,
            })?;
        if (buf.width, buf.height) != (width, height) {
            return Err(GpuError::FormatMismatch(format!(
                "{width}x{height} texture copied into a {}x{} buffer",
                buf.width, buf.height
            )));
        }
        buf.pending = None;
        buf.copied = true;
        let (dst, padded_row) = (buf.buffer.clone(), buf.padded_row);
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &src,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &dst,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn insert_fence(&mut self) -> GpuResult<RawFence> {
        self.submit_pending();
        let flag = Arc::new(AtomicBool::new(false));
        let signal = flag.clone();
        self.queue
            .on_submitted_work_done(move || signal.store(true, Ordering::Release));
        for buf in self.buffers.values_mut() {
            if buf.copied && buf.pending.is_none() {
                buf.pending = Some(flag.clone());
            }
        }
        let id = self.alloc_id();
        self.fences.insert(id, flag);
        Ok(RawFence(id))
    }

    fn fence_signaled(&mut self, fence: RawFence) -> bool {
        let Some(flag) = self.fences.get(&fence.0) else {
            return true;
        };
        if flag.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.device.poll(wgpu::PollType::Poll);
        flag.load(Ordering::Acquire)
    }

    fn wait_fence(&mut self, fence: RawFence) -> GpuResult<()> {
        let Some(flag) = self.fences.remove(&fence.0) else {
            return Ok(());
        };
        while !flag.load(Ordering::Acquire) {
            self.device
                .poll(wgpu::PollType::wait_indefinitely())
                .map_err(|e| GpuError::device(format!("poll failed: {e}")))?;
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: RawBuffer, out: &mut Vec<u8>) -> GpuResult<()> {
        let buf = self
            .buffers
            .get(&buffer.0)
            .ok_or(GpuError::UnknownResource {
                kind: "buffer",
                id: buffer.0,
            })?;
        let in_flight = match &buf.pending {
            Some(flag) => !flag.load(Ordering::Acquire),
            None => buf.copied,
        };
        if in_flight {
            return Err(GpuError::TornRead(buffer.0));
        }

        let slice = buf.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| GpuError::device(format!("poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| GpuError::device("readback channel closed"))?
            .map_err(|e| GpuError::device(format!("buffer map failed: {e}")))?;

        let row_bytes = buf.width as usize * 4;
        let padded = buf.padded_row as usize;
        out.clear();
        {
            let mapped = slice.get_mapped_range();
            for row in 0..buf.height as usize {
                let start = row * padded;
                out.extend_from_slice(&mapped[start..start + row_bytes]);
            }
        }
        buf.buffer.unmap();
        Ok(())
    }

    fn read_pixel(&mut self, texture: RawTexture, x: u32, y: u32) -> GpuResult<[u8; 4]> {
        let tex = self.texture(texture)?;
        if !tex.format.is_host_readable() {
            return Err(GpuError::FormatMismatch(format!(
                "cannot read a {:?} texel as RGBA8",
                tex.format
            )));
        }
        if x >= tex.width || y >= tex.height {
            return Err(GpuError::device(format!(
                "pixel ({x}, {y}) outside {}x{} texture",
                tex.width, tex.height
            )));
        }
        let src = tex.texture.clone();
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pixel Readback"),
            size: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &src,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.submit_pending();

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| GpuError::device(format!("poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| GpuError::device("readback channel closed"))?
            .map_err(|e| GpuError::device(format!("buffer map failed: {e}")))?;
        let pixel = {
            let mapped = slice.get_mapped_range();
            [mapped[0], mapped[1], mapped[2], mapped[3]]
        };
        buffer.unmap();
        Ok(pixel)
    }

    fn flush(&mut self) {
        self.submit_pending();
    }
}
