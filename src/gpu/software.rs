//! CPU reference backend.
//!
//! Textures are plain `Vec<[f32; 4]>` images, programs are per-pixel Rust
//! closures keyed by fragment source text, and fences are simulated with a
//! submission clock: a fence inserted at submission `n` signals once the clock
//! reaches `n + latency`. Mapping a buffer whose fence has not signaled is
//! reported as [`GpuError::TornRead`] and counted in [`SoftwareStats`], which is
//! what the readback tests assert against.
//!
//! Sampling is always nearest-neighbor; the per-draw filter is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{
    DrawCall, GpuBackend, PixelFormat, ProgramDesc, ProgramLayout, RawBuffer, RawFence,
    RawProgram, RawTexture, TextureDesc,
};
use crate::blend::{BLEND_SHADER, BlendUniforms};
use crate::error::{GpuError, GpuResult};
use crate::operation::UNIFORM_HEADER_FLOATS;

/// Per-pixel stand-in for a fragment shader. Called once per target pixel.
pub type Kernel = Arc<dyn Fn(&KernelContext<'_>, u32, u32) -> [f32; 4] + Send + Sync>;

/// What a [`Kernel`] can see while shading one pixel.
pub struct KernelContext<'a> {
    width: u32,
    height: u32,
    uniforms: &'a [u8],
    input: Option<&'a SoftTexture>,
    previous: Option<&'a SoftTexture>,
}

impl KernelContext<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Layer 0 of the bound input, or transparent black when nothing is bound.
    pub fn input(&self, x: u32, y: u32) -> [f32; 4] {
        self.layer(0, x, y)
    }

    pub fn layer(&self, layer: u32, x: u32, y: u32) -> [f32; 4] {
        match self.input {
            Some(tex) if layer < tex.layers => tex.sample(layer, x, y, self.width, self.height),
            _ => [0.0; 4],
        }
    }

    pub fn layer_count(&self) -> u32 {
        self.input.map_or(0, |tex| tex.layers)
    }

    /// The previous-frame texture, falling back to the input like the GPU path does.
    pub fn previous(&self, x: u32, y: u32) -> [f32; 4] {
        match self.previous.or(self.input) {
            Some(tex) => tex.sample(0, x, y, self.width, self.height),
            None => [0.0; 4],
        }
    }

    pub fn uniform_f32(&self, index: usize) -> f32 {
        self.uniforms
            .get(index * 4..index * 4 + 4)
            .map_or(0.0, bytemuck::pod_read_unaligned::<f32>)
    }

    pub fn uniform_u32(&self, index: usize) -> u32 {
        self.uniforms
            .get(index * 4..index * 4 + 4)
            .map_or(0, bytemuck::pod_read_unaligned::<u32>)
    }

    /// First component of operation parameter `slot` (each parameter occupies a
    /// 16-byte slot after the operation uniform header).
    pub fn param(&self, slot: usize) -> f32 {
        self.uniform_f32(UNIFORM_HEADER_FLOATS + slot * 4)
    }
}

pub(crate) struct SoftTexture {
    width: u32,
    height: u32,
    layers: u32,
    format: PixelFormat,
    texels: Vec<[f32; 4]>,
}

impl SoftTexture {
    fn new(desc: &TextureDesc) -> Self {
        let len = desc.width as usize * desc.height as usize * desc.layers as usize;
        Self {
            width: desc.width,
            height: desc.height,
            layers: desc.layers,
            format: desc.format,
            texels: vec![[0.0; 4]; len],
        }
    }

    fn index(&self, layer: u32, x: u32, y: u32) -> usize {
        let plane = self.width as usize * self.height as usize;
        layer as usize * plane + y as usize * self.width as usize + x as usize
    }

    fn get(&self, layer: u32, x: u32, y: u32) -> [f32; 4] {
        self.texels[self.index(layer, x, y)]
    }

    /// Nearest-neighbor read at the pixel center of a `dst_w`x`dst_h` grid.
    fn sample(&self, layer: u32, x: u32, y: u32, dst_w: u32, dst_h: u32) -> [f32; 4] {
        let sx = ((2 * x as u64 + 1) * self.width as u64 / (2 * dst_w as u64)) as u32;
        let sy = ((2 * y as u64 + 1) * self.height as u64 / (2 * dst_h as u64)) as u32;
        self.get(layer, sx.min(self.width - 1), sy.min(self.height - 1))
    }

    fn layer_texels(&self, layer: u32) -> &[[f32; 4]] {
        let plane = self.width as usize * self.height as usize;
        let start = layer as usize * plane;
        &self.texels[start..start + plane]
    }

    fn write_layer(&mut self, layer: u32, texels: impl IntoIterator<Item = [f32; 4]>) {
        let plane = self.width as usize * self.height as usize;
        let start = layer as usize * plane;
        let format = self.format;
        for (slot, texel) in self.texels[start..start + plane].iter_mut().zip(texels) {
            *slot = quantize(format, texel);
        }
    }

    fn rgba8_layer(&self, layer: u32) -> Vec<u8> {
        self.layer_texels(layer)
            .iter()
            .flat_map(|t| t.map(to_unorm8))
            .collect()
    }
}

fn quantize(format: PixelFormat, texel: [f32; 4]) -> [f32; 4] {
    match format {
        PixelFormat::Rgba8Unorm => texel.map(|c| to_unorm8(c) as f32 / 255.0),
        PixelFormat::Rgba16Float => texel,
    }
}

fn to_unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

struct SoftProgram {
    layout: ProgramLayout,
    kernel: Kernel,
    source: String,
}

struct SoftBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
    /// Fence guarding the last copy into this buffer. `None` after a copy means
    /// the copy was recorded but never submitted behind a fence.
    fence: Option<u64>,
    copied: bool,
}

/// Counters exposed for tests and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub draws: u64,
    pub blits: u64,
    pub clears: u64,
    pub uploads: u64,
    pub copies: u64,
    pub fences_inserted: u64,
    /// `wait_fence` calls that actually had to wait.
    pub blocking_waits: u64,
    pub buffer_reads: u64,
    pub torn_reads: u64,
    pub flushes: u64,
}

/// CPU implementation of [`GpuBackend`].
///
/// # Example
///
/// ```
/// use feedloop::SoftwareBackend;
///
/// let mut backend = SoftwareBackend::new().with_fence_latency(2);
/// backend.register_kernel("invert", |ctx, x, y| {
///     let [r, g, b, a] = ctx.input(x, y);
///     [1.0 - r, 1.0 - g, 1.0 - b, a]
/// });
/// ```
pub struct SoftwareBackend {
    next_id: u64,
    textures: HashMap<u64, SoftTexture>,
    programs: HashMap<u64, SoftProgram>,
    buffers: HashMap<u64, SoftBuffer>,
    kernels: HashMap<String, Kernel>,
    failing_draws: HashSet<String>,
    /// Fence id -> clock value at which it signals.
    fences: HashMap<u64, u64>,
    clock: u64,
    fence_latency: u64,
    texture_limit: Option<usize>,
    stats: SoftwareStats,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        let mut backend = Self {
            next_id: 1,
            textures: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            kernels: HashMap::new(),
            failing_draws: HashSet::new(),
            fences: HashMap::new(),
            clock: 0,
            fence_latency: 1,
            texture_limit: None,
            stats: SoftwareStats::default(),
        };
        backend.register_kernel(BLEND_SHADER, blend_kernel);
        backend
    }

    /// Number of submissions a fence stays unsignaled for.
    pub fn with_fence_latency(mut self, latency: u64) -> Self {
        self.fence_latency = latency;
        self
    }

    /// Fail texture allocation once this many textures are alive.
    pub fn with_texture_limit(mut self, limit: usize) -> Self {
        self.texture_limit = Some(limit);
        self
    }

    /// Make programs whose fragment source is `key` link and shade with
    /// `kernel`. Programs matching no kernel fail to link, whatever their label.
    pub fn register_kernel<F>(&mut self, key: impl Into<String>, kernel: F)
    where
        F: Fn(&KernelContext<'_>, u32, u32) -> [f32; 4] + Send + Sync + 'static,
    {
        self.kernels.insert(key.into(), Arc::new(kernel));
    }

    /// Draws with programs whose fragment source is `key` fail with a device
    /// error, as a lost or wedged device would.
    pub fn fail_draws(&mut self, key: impl Into<String>) {
        self.failing_draws.insert(key.into());
    }

    pub fn stats(&self) -> &SoftwareStats {
        &self.stats
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Texels of one layer, as stored (already quantized to the texture format).
    pub fn texels(&self, texture: RawTexture, layer: u32) -> Option<Vec<[f32; 4]>> {
        let tex = self.textures.get(&texture.0)?;
        (layer < tex.layers).then(|| tex.layer_texels(layer).to_vec())
    }

    pub fn texture_size(&self, texture: RawTexture) -> Option<(u32, u32, u32)> {
        self.textures
            .get(&texture.0)
            .map(|tex| (tex.width, tex.height, tex.layers))
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, texture: RawTexture) -> GpuResult<&SoftTexture> {
        self.textures
            .get(&texture.0)
            .ok_or(GpuError::UnknownResource {
                kind: "texture",
                id: texture.0,
            })
    }

    fn texture_mut(&mut self, texture: RawTexture) -> GpuResult<&mut SoftTexture> {
        self.textures
            .get_mut(&texture.0)
            .ok_or(GpuError::UnknownResource {
                kind: "texture",
                id: texture.0,
            })
    }

    fn check_layer(tex: &SoftTexture, layer: u32, id: u64) -> GpuResult<()> {
        if layer >= tex.layers {
            return Err(GpuError::device(format!(
                "layer {layer} out of range for texture {id} with {} layers",
                tex.layers
            )));
        }
        Ok(())
    }

    fn signaled(&self, fence: u64) -> bool {
        self.fences
            .get(&fence)
            .is_none_or(|&ready_at| self.clock >= ready_at)
    }
}

fn blend_kernel(ctx: &KernelContext<'_>, x: u32, y: u32) -> [f32; 4] {
    let size = std::mem::size_of::<BlendUniforms>();
    let Some(bytes) = ctx.uniforms.get(..size) else {
        return [0.0; 4];
    };
    let uniforms: BlendUniforms = bytemuck::pod_read_unaligned(bytes);
    let mut out = [0.0f32; 4];
    for layer in 0..uniforms.count.min(ctx.layer_count()) {
        let weight = uniforms.weight(layer as usize);
        let texel = ctx.layer(layer, x, y);
        for (o, c) in out.iter_mut().zip(texel) {
            *o += c * weight;
        }
    }
    out
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<RawTexture> {
        if let Some(limit) = self.texture_limit
            && self.textures.len() >= limit
        {
            return Err(GpuError::allocation(
                desc.label,
                format!("texture limit of {limit} reached"),
            ));
        }
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(GpuError::allocation(desc.label, "zero-sized texture"));
        }
        let id = self.alloc_id();
        self.textures.insert(id, SoftTexture::new(desc));
        Ok(RawTexture(id))
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        self.textures.remove(&texture.0);
    }

    fn clear(&mut self, texture: RawTexture, layer: u32, color: [f32; 4]) -> GpuResult<()> {
        let tex = self.texture_mut(texture)?;
        Self::check_layer(tex, layer, texture.0)?;
        let plane = tex.width as usize * tex.height as usize;
        tex.write_layer(layer, std::iter::repeat_n(color, plane));
        self.stats.clears += 1;
        Ok(())
    }

    fn blit(
        &mut self,
        src: RawTexture,
        src_layer: u32,
        dst: RawTexture,
        dst_layer: u32,
    ) -> GpuResult<()> {
        let source = self.texture(src)?;
        Self::check_layer(source, src_layer, src.0)?;
        let (dst_w, dst_h) = {
            let target = self.texture(dst)?;
            Self::check_layer(target, dst_layer, dst.0)?;
            (target.width, target.height)
        };
        let texels: Vec<[f32; 4]> = (0..dst_h)
            .flat_map(|y| (0..dst_w).map(move |x| (x, y)))
            .map(|(x, y)| source.sample(src_layer, x, y, dst_w, dst_h))
            .collect();
        self.texture_mut(dst)?.write_layer(dst_layer, texels);
        self.stats.blits += 1;
        Ok(())
    }

    fn upload_rgba8(&mut self, texture: RawTexture, layer: u32, pixels: &[u8]) -> GpuResult<()> {
        let tex = self.texture_mut(texture)?;
        Self::check_layer(tex, layer, texture.0)?;
        let expected = tex.width as usize * tex.height as usize * 4;
        if pixels.len() != expected {
            return Err(GpuError::FormatMismatch(format!(
                "upload of {} bytes into a texture expecting {expected}",
                pixels.len()
            )));
        }
        tex.write_layer(
            layer,
            pixels
                .chunks_exact(4)
                .map(|p| [p[0], p[1], p[2], p[3]].map(|c| c as f32 / 255.0)),
        );
        self.stats.uploads += 1;
        Ok(())
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> GpuResult<RawProgram> {
        let kernel = self
            .kernels
            .get(desc.fragment)
            .cloned()
            .ok_or_else(|| {
                GpuError::shader_link(desc.label, "no kernel registered for this program")
            })?;
        let id = self.alloc_id();
        self.programs.insert(
            id,
            SoftProgram {
                layout: desc.layout,
                kernel,
                source: desc.fragment.to_owned(),
            },
        );
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
        if self.failing_draws.contains(&program.source) {
            return Err(GpuError::device("draw rejected by the device"));
        }
        let input = call.input.map(|t| self.texture(t)).transpose()?;
        let previous = call.previous.map(|t| self.texture(t)).transpose()?;
        if program.layout == ProgramLayout::Single
            && let Some(tex) = input
            && tex.layers != 1
        {
            return Err(GpuError::FormatMismatch(
                "single-input program bound to a layered texture".into(),
            ));
        }
        let target = self.texture(call.target)?;
        let (width, height) = (target.width, target.height);
        let ctx = KernelContext {
            width,
            height,
            uniforms: call.uniforms,
            input,
            previous,
        };
        let kernel = program.kernel.clone();
        let texels: Vec<[f32; 4]> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| kernel(&ctx, x, y))
            .collect();
        self.texture_mut(call.target)?.write_layer(0, texels);
        self.stats.draws += 1;
        Ok(())
    }

    fn create_readback_buffer(&mut self, width: u32, height: u32) -> GpuResult<RawBuffer> {
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            SoftBuffer {
                width,
                height,
                data: vec![0; width as usize * height as usize * 4],
                fence: None,
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
        let (width, height) = (tex.width, tex.height);
        let pixels = tex.rgba8_layer(0);
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
        buf.data = pixels;
        buf.fence = None;
        buf.copied = true;
        self.stats.copies += 1;
        Ok(())
    }

    fn insert_fence(&mut self) -> GpuResult<RawFence> {
        self.clock += 1;
        let id = self.alloc_id();
        self.fences.insert(id, self.clock + self.fence_latency);
        for buf in self.buffers.values_mut() {
            if buf.copied && buf.fence.is_none() {
                buf.fence = Some(id);
            }
        }
        self.stats.fences_inserted += 1;
        Ok(RawFence(id))
    }

    fn fence_signaled(&mut self, fence: RawFence) -> bool {
        self.signaled(fence.0)
    }

    fn wait_fence(&mut self, fence: RawFence) -> GpuResult<()> {
        if let Some(ready_at) = self.fences.remove(&fence.0)
            && self.clock < ready_at
        {
            self.clock = ready_at;
            self.stats.blocking_waits += 1;
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
        let in_flight = match buf.fence {
            Some(fence) => !self.signaled(fence),
            None => buf.copied,
        };
        if in_flight {
            self.stats.torn_reads += 1;
            return Err(GpuError::TornRead(buffer.0));
        }
        out.clear();
        out.extend_from_slice(&buf.data);
        self.stats.buffer_reads += 1;
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
        Ok(tex.get(0, x, y).map(to_unorm8))
    }

    fn flush(&mut self) {
        self.clock += 1;
        self.stats.flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32) -> TextureDesc<'static> {
        TextureDesc {
            label: "test",
            width,
            height,
            layers: 1,
            layered: false,
            format: PixelFormat::Rgba8Unorm,
        }
    }

    #[test]
    fn blit_upscale_then_downscale_is_exact() {
        let mut gpu = SoftwareBackend::new();
        let small = gpu.create_texture(&desc(3, 2)).unwrap();
        let big = gpu.create_texture(&desc(6, 4)).unwrap();
        let back = gpu.create_texture(&desc(3, 2)).unwrap();
        let pixels: Vec<u8> = (0..24).map(|i| (i * 10) as u8).collect();
        gpu.upload_rgba8(small, 0, &pixels).unwrap();

        gpu.blit(small, 0, big, 0).unwrap();
        gpu.blit(big, 0, back, 0).unwrap();

        assert_eq!(gpu.texels(small, 0), gpu.texels(back, 0));
    }

    #[test]
    fn fences_signal_after_latency() {
        let mut gpu = SoftwareBackend::new().with_fence_latency(2);
        let fence = gpu.insert_fence().unwrap();
        assert!(!gpu.fence_signaled(fence));
        gpu.flush();
        assert!(!gpu.fence_signaled(fence));
        gpu.flush();
        assert!(gpu.fence_signaled(fence));
    }

    #[test]
    fn reading_an_unfenced_copy_is_a_torn_read() {
        let mut gpu = SoftwareBackend::new().with_fence_latency(3);
        let tex = gpu.create_texture(&desc(2, 2)).unwrap();
        let buf = gpu.create_readback_buffer(2, 2).unwrap();
        gpu.copy_to_buffer(tex, buf).unwrap();

        let mut out = Vec::new();
        assert_eq!(gpu.read_buffer(buf, &mut out), Err(GpuError::TornRead(buf.0)));

        let fence = gpu.insert_fence().unwrap();
        assert!(gpu.read_buffer(buf, &mut out).is_err());
        gpu.wait_fence(fence).unwrap();
        gpu.read_buffer(buf, &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(gpu.stats().torn_reads, 2);
    }

    #[test]
    fn unknown_kernel_fails_to_link() {
        let mut gpu = SoftwareBackend::new();
        let err = gpu
            .create_program(&ProgramDesc {
                label: "missing",
                vertex: "",
                fragment: "",
                layout: ProgramLayout::Single,
            })
            .unwrap_err();
        assert!(matches!(err, GpuError::ShaderLink { .. }));
    }

    #[test]
    fn label_alone_does_not_link_a_program() {
        let mut gpu = SoftwareBackend::new();
        gpu.register_kernel("invert", |ctx, x, y| ctx.input(x, y));
        let err = gpu
            .create_program(&ProgramDesc {
                label: "invert",
                vertex: "",
                fragment: "not a shader",
                layout: ProgramLayout::Single,
            })
            .unwrap_err();
        assert!(matches!(err, GpuError::ShaderLink { .. }));
    }

    #[test]
    fn blend_program_links_by_its_shader_source() {
        let mut gpu = SoftwareBackend::new();
        let program = gpu.create_program(&ProgramDesc {
            label: "anything",
            vertex: BLEND_SHADER,
            fragment: BLEND_SHADER,
            layout: ProgramLayout::Layered,
        });
        assert!(program.is_ok());
    }

    #[test]
    fn failing_draws_report_a_device_error() {
        let mut gpu = SoftwareBackend::new();
        gpu.register_kernel("pass", |ctx, x, y| ctx.input(x, y));
        gpu.fail_draws("pass");
        let target = gpu.create_texture(&desc(1, 1)).unwrap();
        let program = gpu
            .create_program(&ProgramDesc {
                label: "pass",
                vertex: "",
                fragment: "pass",
                layout: ProgramLayout::Single,
            })
            .unwrap();
        let err = gpu
            .draw(&DrawCall {
                program,
                target,
                input: None,
                previous: None,
                uniforms: &[],
                filter: crate::gpu::FilterMode::Nearest,
            })
            .unwrap_err();
        assert!(matches!(err, GpuError::Device(_)));
        assert_eq!(gpu.stats().draws, 0);
    }

    #[test]
    fn texture_limit_simulates_exhaustion() {
        let mut gpu = SoftwareBackend::new().with_texture_limit(1);
        assert!(gpu.create_texture(&desc(1, 1)).is_ok());
        assert!(matches!(
            gpu.create_texture(&desc(1, 1)),
            Err(GpuError::Allocation { .. })
        ));
    }
}
