//! # Feedloop
//!
//! **A GPU-resident image feedback compositor.**
//!
//! Build a graph of fragment-shader operations fed by seeds (noise, still
//! images, camera frames), wire some edges as *blit* feedback so a node reads
//! the previous frame of another, and render the whole graph once per tick.
//! Everything stays on the GPU; the selected output comes back to the host
//! through a pipelined readback ring that never stalls rendering.
//!
//! ## Quick Start
//!
//! ```no_run
//! use feedloop::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let gpu = GpuContext::headless()?;
//!     let mut engine = Engine::new(gpu, RenderingConfig::new().size(512, 512))?;
//!
//!     let noise = engine.add_seed(SeedKind::ColorNoise, true);
//!     let warp = engine.add_operation(OperationDesc::new(
//!         "warp",
//!         ShaderSource::fragment_only(std::fs::read_to_string("src/shaders/warp.wgsl")?),
//!     ));
//!     engine.connect(noise, warp, 1.0);
//!     // Feed warp's last frame back into itself through a blend.
//!     let fade = engine.add_operation(OperationDesc::new(
//!         "fade",
//!         ShaderSource::fragment_only(std::fs::read_to_string("src/shaders/fade.wgsl")?),
//!     ));
//!     engine.connect(warp, fade, 1.0);
//!     engine.connect(fade, warp, 1.0);
//!     engine.equalize_blend_factors(warp);
//!     engine.set_edge_type(fade, warp, EdgeKind::Blit);
//!     engine.set_output(Some(fade));
//!
//!     for _ in 0..60 {
//!         engine.iterate()?;
//!     }
//!     engine.output_image()?.save("frame.png")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`TextureManager`] hands out stable [`TextureHandle`]s and swaps the
//!   underlying storage on resize or format change, preserving contents.
//! - [`Graph`] tracks operations, seeds and typed edges, and keeps a
//!   topological order that breaks cycles at [`EdgeKind::Blit`] edges.
//! - [`Engine`] owns it all and renders a frame with [`Engine::iterate`].
//! - [`GpuBackend`] is the seam between the compositor and the device:
//!   [`GpuContext`] runs on wgpu, [`SoftwareBackend`] on the CPU.

mod blend;
mod config;
mod error;
mod gpu;
pub mod graph;
mod operation;
mod pipeline;
mod readback;
mod seed;
pub mod snapshot;
mod texture;

pub use blend::{BLEND_PROGRAM_LABEL, BLEND_SHADER, BlendUniforms, Blender};
pub use config::{MAX_BLEND_LAYERS, RenderingConfig};
pub use error::{FeedError, FeedResult, GpuError, GpuResult};
pub use gpu::{
    CommandScope, DrawCall, FilterMode, GpuBackend, GpuContext, Kernel, KernelContext,
    PixelFormat, ProgramDesc, ProgramLayout, RawBuffer, RawFence, RawProgram, RawTexture,
    SoftwareBackend, SoftwareStats, TextureDesc,
};
pub use graph::{EdgeKind, Graph, GraphEvent, GraphNode, InputEdge, NodeId, NodeKind};
pub use operation::{
    FULLSCREEN_VERTEX, Operation, OperationDesc, OperationUniforms, Param, ParamSet, ParamValue,
    ShaderSource, UNIFORM_HEADER_FLOATS,
};
pub use pipeline::Engine;
pub use readback::Readback;
pub use seed::{Seed, SeedKind, letterbox};
pub use snapshot::GraphSnapshot;
pub use texture::{OrthoBounds, TextureHandle, TextureManager};

// Re-export glam math types for convenience
pub use glam::{Mat4, Vec2, Vec3, Vec4};
