//! GPU backend abstraction.
//!
//! The compositor never talks to wgpu directly outside of [`GpuContext`]. Every
//! component issues work through the [`GpuBackend`] trait using small opaque
//! handles ([`RawTexture`], [`RawProgram`], [`RawBuffer`], [`RawFence`]), which
//! keeps the scheduler, pipeline and readback logic backend-agnostic.
//!
//! Two backends ship with the crate:
//!
//! - [`GpuContext`]: wgpu on a headless device. This is the production backend.
//! - [`SoftwareBackend`]: a CPU reference implementation with per-pixel kernels
//!   standing in for shader programs and a fence simulator. The test-suite runs
//!   entirely on it.
//!
//! # Program layouts
//!
//! Programs declare one of two binding layouts (see [`ProgramLayout`]). For the
//! wgpu backend, shaders must define `vs` and `fs` entry points and use:
//!
//! ```wgsl
//! // ProgramLayout::Single
//! @group(0) @binding(0) var<uniform> u: Uniforms;
//! @group(0) @binding(1) var input_texture: texture_2d<f32>;
//! @group(0) @binding(2) var input_sampler: sampler;
//! @group(0) @binding(3) var previous_texture: texture_2d<f32>;
//!
//! // ProgramLayout::Layered
//! @group(0) @binding(0) var<uniform> u: Uniforms;
//! @group(0) @binding(1) var layers: texture_2d_array<f32>;
//! @group(0) @binding(2) var input_sampler: sampler;
//! ```

mod context;
mod scope;
mod software;

pub use context::GpuContext;
pub use scope::CommandScope;
pub use software::{Kernel, KernelContext, SoftwareBackend, SoftwareStats};

use serde::{Deserialize, Serialize};

use crate::error::GpuResult;

/// Storage format of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit normalized RGBA. The only format readback buffers accept.
    #[default]
    Rgba8Unorm,
    /// 16-bit float RGBA, for feedback loops that need headroom.
    Rgba16Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8Unorm => 4,
            PixelFormat::Rgba16Float => 8,
        }
    }

    /// Whether pixels in this format can be copied straight into a host RGBA8 image.
    pub fn is_host_readable(self) -> bool {
        self == PixelFormat::Rgba8Unorm
    }
}

/// Sampler filter used when an operation reads its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Backend-native texture handle. Owned by the [`TextureManager`](crate::TextureManager),
/// which maps stable [`TextureHandle`](crate::TextureHandle)s onto these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawTexture(pub(crate) u64);

/// Backend-native compiled shader program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawProgram(pub(crate) u64);

/// Backend-native host-readable transfer buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawBuffer(pub(crate) u64);

/// Marker for "all work submitted so far". Signals once the GPU has finished it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawFence(pub(crate) u64);

#[derive(Clone, Debug)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    /// Number of array layers. Layered textures are always created as arrays,
    /// even with a single layer, so they can be bound as `texture_2d_array`.
    pub layers: u32,
    pub layered: bool,
    pub format: PixelFormat,
}

/// Binding layout a program expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramLayout {
    /// One input texture plus an optional previous-frame texture.
    Single,
    /// A layered input texture (blend inputs or temporal history).
    Layered,
}

#[derive(Clone, Debug)]
pub struct ProgramDesc<'a> {
    pub label: &'a str,
    pub vertex: &'a str,
    pub fragment: &'a str,
    pub layout: ProgramLayout,
}

/// One fullscreen draw.
#[derive(Clone, Debug)]
pub struct DrawCall<'a> {
    pub program: RawProgram,
    /// Input bound at binding 1. For [`ProgramLayout::Layered`] programs this must
    /// be a layered texture. `None` binds an all-zero texture.
    pub input: Option<RawTexture>,
    /// Previous-frame texture bound at binding 3 for [`ProgramLayout::Single`].
    /// Falls back to `input` when absent.
    pub previous: Option<RawTexture>,
    pub target: RawTexture,
    pub uniforms: &'a [u8],
    pub filter: FilterMode,
}

/// The set of GPU primitives the compositor needs.
///
/// Commands may be recorded lazily; [`flush`](Self::flush) submits whatever is
/// pending. Work is always executed in the order it was issued.
pub trait GpuBackend {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<RawTexture>;
    fn destroy_texture(&mut self, texture: RawTexture);

    /// Fill one layer of `texture` with `color`.
    fn clear(&mut self, texture: RawTexture, layer: u32, color: [f32; 4]) -> GpuResult<()>;

    /// Copy one layer into another, rescaling with nearest-neighbor sampling and
    /// converting format when the two textures differ.
    fn blit(
        &mut self,
        src: RawTexture,
        src_layer: u32,
        dst: RawTexture,
        dst_layer: u32,
    ) -> GpuResult<()>;

    /// Replace one layer with tightly packed RGBA8 pixels of the texture's size.
    fn upload_rgba8(&mut self, texture: RawTexture, layer: u32, pixels: &[u8]) -> GpuResult<()>;

    fn create_program(&mut self, desc: &ProgramDesc) -> GpuResult<RawProgram>;
    fn destroy_program(&mut self, program: RawProgram);
    fn draw(&mut self, call: &DrawCall) -> GpuResult<()>;

    /// Allocate a transfer buffer large enough for a `width`x`height` RGBA8 image.
    fn create_readback_buffer(&mut self, width: u32, height: u32) -> GpuResult<RawBuffer>;
    fn destroy_buffer(&mut self, buffer: RawBuffer);

    /// Record an asynchronous copy of layer 0 of an RGBA8 texture into `buffer`.
    fn copy_to_buffer(&mut self, texture: RawTexture, buffer: RawBuffer) -> GpuResult<()>;

    /// Submit pending work and return a fence that signals when it completes.
    fn insert_fence(&mut self) -> GpuResult<RawFence>;
    /// Non-blocking fence check.
    fn fence_signaled(&mut self, fence: RawFence) -> bool;
    /// Block until `fence` signals. Releases the fence.
    fn wait_fence(&mut self, fence: RawFence) -> GpuResult<()>;

    /// Map `buffer`, copy its tightly packed RGBA8 contents into `out`, unmap.
    fn read_buffer(&mut self, buffer: RawBuffer, out: &mut Vec<u8>) -> GpuResult<()>;

    /// Synchronous single-pixel read of layer 0 of an RGBA8 texture.
    fn read_pixel(&mut self, texture: RawTexture, x: u32, y: u32) -> GpuResult<[u8; 4]>;

    /// Submit everything recorded so far.
    fn flush(&mut self);
}
