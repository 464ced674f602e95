//! Shader-backed operations.
//!
//! An [`Operation`] is one node's transfer function: a vertex/fragment program,
//! a typed parameter set and the render targets it owns. The engine owns every
//! operation and hands the graph only its [`NodeId`](crate::NodeId).
//!
//! # Uniform layout
//!
//! Every operation program receives the same 80-byte header followed by its
//! parameters, one 16-byte slot each (a `mat4x4f` takes four):
//!
//! ```wgsl
//! struct Uniforms {
//!     projection: mat4x4f,
//!     resolution: vec2f,
//!     time: f32,
//!     iteration: u32,
//!     // parameters, in declaration order
//!     gain: vec4f,
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::GpuResult;
use crate::gpu::{DrawCall, FilterMode, GpuBackend, ProgramDesc, ProgramLayout, RawProgram};
use crate::texture::{OrthoBounds, TextureHandle, TextureManager};

/// Number of `f32`s in [`OperationUniforms`].
pub const UNIFORM_HEADER_FLOATS: usize = 20;

/// Fullscreen-triangle vertex stage used when an operation only supplies a
/// fragment stage. Outputs clip position and a top-left-origin `uv`.
pub const FULLSCREEN_VERTEX: &str = r#"
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
"#;

/// Fixed header of every operation uniform block.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OperationUniforms {
    pub projection: [[f32; 4]; 4],
    pub resolution: [f32; 2],
    pub time: f32,
    pub iteration: u32,
}

/// Vertex and fragment source of an operation program.
///
/// With the wgpu backend a single WGSL module may carry both entry points; it
/// is then passed as both stages. The source text is opaque to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

impl ShaderSource {
    pub fn new(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    /// Pair `fragment` with [`FULLSCREEN_VERTEX`].
    pub fn fragment_only(fragment: impl Into<String>) -> Self {
        Self::new(FULLSCREEN_VERTEX, fragment)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
    /// Enumeration: the selected index into `options`.
    Choice { index: u32, options: Vec<String> },
}

impl ParamValue {
    /// Uniform slots (16 bytes each) this value occupies.
    pub fn slots(&self) -> usize {
        match self {
            ParamValue::Mat4(_) => 4,
            _ => 1,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut slot = [0u8; 16];
        match self {
            ParamValue::Float(v) => slot[..4].copy_from_slice(bytemuck::bytes_of(v)),
            ParamValue::Int(v) => slot[..4].copy_from_slice(bytemuck::bytes_of(v)),
            ParamValue::Bool(v) => slot[..4].copy_from_slice(bytemuck::bytes_of(&(*v as u32))),
            ParamValue::Vec2(v) => slot[..8].copy_from_slice(bytemuck::cast_slice(v)),
            ParamValue::Vec3(v) => slot[..12].copy_from_slice(bytemuck::cast_slice(v)),
            ParamValue::Vec4(v) => slot.copy_from_slice(bytemuck::cast_slice(v)),
            ParamValue::Choice { index, .. } => {
                slot[..4].copy_from_slice(bytemuck::bytes_of(index))
            }
            ParamValue::Mat4(m) => {
                out.extend_from_slice(bytemuck::cast_slice(m));
                return;
            }
        }
        out.extend_from_slice(&slot);
    }

    /// Write one scalar into this value. `component` selects a vector lane or
    /// matrix element; `None` addresses the first.
    fn set_component(&mut self, component: Option<usize>, value: f32) -> bool {
        let lane = component.unwrap_or(0);
        match self {
            ParamValue::Float(v) if lane == 0 => *v = value,
            ParamValue::Int(v) if lane == 0 => *v = value.round() as i32,
            ParamValue::Bool(v) if lane == 0 => *v = value >= 0.5,
            ParamValue::Vec2(v) if lane < 2 => v[lane] = value,
            ParamValue::Vec3(v) if lane < 3 => v[lane] = value,
            ParamValue::Vec4(v) if lane < 4 => v[lane] = value,
            ParamValue::Mat4(m) if lane < 16 => m[lane] = value,
            ParamValue::Choice { index, options } if lane == 0 => {
                let max = options.len().saturating_sub(1) as f32;
                *index = value.round().clamp(0.0, max) as u32;
            }
            _ => return false,
        }
        true
    }
}

/// One named, optionally range-limited parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f32, f32)>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
            range: None,
        }
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self::new(name, ParamValue::Float(value))
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.range = Some((min, max));
        self
    }
}

/// Ordered parameter list of an operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, param: Param) -> Self {
        self.push(param);
        self
    }

    /// Add a parameter, replacing any existing one with the same name.
    pub fn push(&mut self, param: Param) {
        match self.params.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.params.push(param),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Replace a parameter's value wholesale. Fails if the name is unknown or the
    /// value has a different type.
    pub fn set(&mut self, name: &str, value: ParamValue) -> bool {
        let Some(param) = self.params.iter_mut().find(|p| p.name == name) else {
            return false;
        };
        if std::mem::discriminant(&param.value) != std::mem::discriminant(&value) {
            return false;
        }
        param.value = value;
        true
    }

    /// Scalar write as sent by a UI slider or a MIDI controller.
    ///
    /// `name` may address one component: `offset.y`, `tint.w`, or `xform.12` for
    /// a matrix element. The value is clamped to the parameter's range.
    pub fn set_scalar(&mut self, name: &str, value: f32) -> bool {
        let (base, component) = split_component(name);
        let Some(param) = self.params.iter_mut().find(|p| p.name == base) else {
            return false;
        };
        let value = match param.range {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        };
        param.value.set_component(component, value)
    }

    /// Pack every parameter into 16-byte uniform slots, in declaration order.
    pub fn to_uniform_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.params.iter().map(|p| p.value.slots() * 16).sum());
        for param in &self.params {
            param.value.write(&mut out);
        }
        out
    }
}

fn split_component(name: &str) -> (&str, Option<usize>) {
    let Some((base, suffix)) = name.rsplit_once('.') else {
        return (name, None);
    };
    let lane = match suffix {
        "x" | "r" => Some(0),
        "y" | "g" => Some(1),
        "z" | "b" => Some(2),
        "w" | "a" => Some(3),
        other => other.parse().ok(),
    };
    match lane {
        Some(lane) => (base, Some(lane)),
        None => (name, None),
    }
}

/// Everything needed to build an [`Operation`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationDesc {
    pub name: String,
    pub shader: ShaderSource,
    #[serde(default)]
    pub params: ParamSet,
    /// Layers of temporal input history. Zero disables history; otherwise the
    /// program is bound with [`ProgramLayout::Layered`] and layer 0 holds the
    /// current input.
    #[serde(default)]
    pub history_depth: u32,
    /// Sampler filter; `None` uses the configured default.
    #[serde(default)]
    pub filter: Option<FilterMode>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl OperationDesc {
    pub fn new(name: impl Into<String>, shader: ShaderSource) -> Self {
        Self {
            name: name.into(),
            shader,
            params: ParamSet::new(),
            history_depth: 0,
            filter: None,
            enabled: true,
        }
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_history(mut self, depth: u32) -> Self {
        self.history_depth = depth;
        self
    }

    pub fn with_filter(mut self, filter: FilterMode) -> Self {
        self.filter = Some(filter);
        self
    }
}

pub struct Operation {
    desc: OperationDesc,
    program: Option<RawProgram>,
    shader_error: Option<String>,
    in_texture: TextureHandle,
    out_texture: TextureHandle,
    blit_texture: Option<TextureHandle>,
    history: Option<TextureHandle>,
    bounds: OrthoBounds,
}

impl Operation {
    pub(crate) fn new(
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        desc: OperationDesc,
    ) -> Self {
        let in_texture = textures.create_texture(gpu, &format!("{} in", desc.name));
        let out_texture = textures.create_texture(gpu, &format!("{} out", desc.name));
        let history = (desc.history_depth > 0).then(|| {
            textures.create_array_texture(
                gpu,
                &format!("{} history", desc.name),
                desc.history_depth,
            )
        });
        let mut op = Self {
            desc,
            program: None,
            shader_error: None,
            in_texture,
            out_texture,
            blit_texture: None,
            history,
            bounds: textures.bounds(),
        };
        op.compile(gpu);
        op
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn desc(&self) -> &OperationDesc {
        &self.desc
    }

    pub fn params(&self) -> &ParamSet {
        &self.desc.params
    }

    pub fn is_enabled(&self) -> bool {
        self.desc.enabled
    }

    /// Link diagnostic of the current shader, if it failed.
    pub fn shader_error(&self) -> Option<&str> {
        self.shader_error.as_deref()
    }

    /// Whether the operation currently renders as a pass-through.
    pub fn is_pass_through(&self) -> bool {
        self.program.is_none() || !self.desc.enabled
    }

    pub fn in_texture(&self) -> TextureHandle {
        self.in_texture
    }

    pub fn out_texture(&self) -> TextureHandle {
        self.out_texture
    }

    /// Last frame's output, if any consumer reads this operation through a blit edge.
    pub fn blit_texture(&self) -> Option<TextureHandle> {
        self.blit_texture
    }

    pub fn bounds(&self) -> OrthoBounds {
        self.bounds
    }

    pub(crate) fn set_bounds(&mut self, bounds: OrthoBounds) {
        self.bounds = bounds;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.desc.enabled = enabled;
    }

    pub(crate) fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.desc.params
    }

    fn layout(&self) -> ProgramLayout {
        if self.history.is_some() {
            ProgramLayout::Layered
        } else {
            ProgramLayout::Single
        }
    }

    fn compile(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(old) = self.program.take() {
            gpu.destroy_program(old);
        }
        let desc = ProgramDesc {
            label: &self.desc.name,
            vertex: &self.desc.shader.vertex,
            fragment: &self.desc.shader.fragment,
            layout: self.layout(),
        };
        match gpu.create_program(&desc) {
            Ok(program) => {
                self.program = Some(program);
                self.shader_error = None;
            }
            Err(err) => {
                tracing::warn!(operation = %self.desc.name, %err, "shader failed, rendering as pass-through");
                self.shader_error = Some(err.to_string());
            }
        }
    }

    /// Swap in new shader source and relink.
    pub(crate) fn set_shader(&mut self, gpu: &mut dyn GpuBackend, shader: ShaderSource) {
        self.desc.shader = shader;
        self.compile(gpu);
    }

    /// Allocate or release the previous-frame snapshot target.
    pub(crate) fn set_blit_enabled(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        enabled: bool,
    ) {
        match (enabled, self.blit_texture) {
            (true, None) => {
                let handle = textures.create_texture(gpu, &format!("{} blit", self.desc.name));
                self.blit_texture = Some(handle);
            }
            (false, Some(handle)) => {
                textures.destroy(gpu, handle);
                self.blit_texture = None;
            }
            _ => {}
        }
    }

    /// Copy the current output into the blit target.
    pub(crate) fn snapshot(
        &self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
    ) -> GpuResult<()> {
        match self.blit_texture {
            Some(blit) => textures.blit(gpu, self.out_texture, blit),
            None => Ok(()),
        }
    }

    /// Shift history down one layer and store `input` in layer 0.
    pub(crate) fn push_history(
        &self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
        input: Option<TextureHandle>,
    ) -> GpuResult<()> {
        let Some(history) = self.history else {
            return Ok(());
        };
        for layer in (1..self.desc.history_depth).rev() {
            textures.copy_layer(gpu, history, layer - 1, layer)?;
        }
        match input.filter(|&h| textures.raw(h).is_some()) {
            Some(input) => textures.copy_to_layer(gpu, input, history, 0),
            None => textures.clear_array_layer(gpu, history, 0),
        }
    }

    pub fn uniform_bytes(&self, resolution: [f32; 2], time: f32, iteration: u32) -> Vec<u8> {
        let header = OperationUniforms {
            projection: self.bounds.projection().to_cols_array_2d(),
            resolution,
            time,
            iteration,
        };
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(&self.desc.params.to_uniform_bytes());
        bytes
    }

    /// Draw one frame from `input` into the output target. Disabled or unlinked
    /// operations copy `input` through instead.
    pub(crate) fn render(
        &self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
        input: Option<TextureHandle>,
        frame: FrameInfo,
    ) -> GpuResult<()> {
        let Some(target) = textures.raw(self.out_texture) else {
            return Ok(());
        };
        let input_raw = input.and_then(|h| textures.raw(h));
        // History advances every tick, even while the operation passes through.
        self.push_history(gpu, textures, input)?;

        let program = match self.program {
            Some(program) if self.desc.enabled => program,
            _ => {
                return match input {
                    Some(input) if input_raw.is_some() => {
                        textures.blit(gpu, input, self.out_texture)
                    }
                    _ => gpu.clear(target, 0, [0.0; 4]),
                };
            }
        };

        let bound = match self.history {
            Some(history) => textures.raw(history),
            None => input_raw,
        };
        let previous = self.blit_texture.and_then(|h| textures.raw(h));
        let uniforms = self.uniform_bytes(frame.resolution, frame.time, frame.iteration);
        gpu.draw(&DrawCall {
            program,
            input: bound,
            previous,
            target,
            uniforms: &uniforms,
            filter: self.desc.filter.unwrap_or(frame.filter),
        })
    }

    pub(crate) fn destroy(self, gpu: &mut dyn GpuBackend, textures: &mut TextureManager) {
        if let Some(program) = self.program {
            gpu.destroy_program(program);
        }
        for handle in [Some(self.in_texture), Some(self.out_texture), self.blit_texture, self.history]
            .into_iter()
            .flatten()
        {
            textures.destroy(gpu, handle);
        }
    }
}

/// Per-tick values shared by every operation draw.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameInfo {
    pub resolution: [f32; 2],
    pub time: f32,
    pub iteration: u32,
    pub filter: FilterMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_twenty_floats() {
        assert_eq!(
            std::mem::size_of::<OperationUniforms>(),
            UNIFORM_HEADER_FLOATS * 4
        );
    }

    #[test]
    fn set_scalar_addresses_components_and_clamps() {
        let mut params = ParamSet::new()
            .with(Param::float("gain", 1.0).with_range(0.0, 2.0))
            .with(Param::new("offset", ParamValue::Vec2([0.0, 0.0])))
            .with(Param::new(
                "mode",
                ParamValue::Choice {
                    index: 0,
                    options: vec!["add".into(), "mul".into()],
                },
            ));

        assert!(params.set_scalar("gain", 5.0));
        assert!(params.set_scalar("offset.y", 0.25));
        assert!(params.set_scalar("mode", 7.0));
        assert!(!params.set_scalar("offset.z", 1.0));
        assert!(!params.set_scalar("missing", 1.0));

        assert_eq!(params.get("gain").unwrap().value, ParamValue::Float(2.0));
        assert_eq!(
            params.get("offset").unwrap().value,
            ParamValue::Vec2([0.0, 0.25])
        );
        assert!(matches!(
            params.get("mode").unwrap().value,
            ParamValue::Choice { index: 1, .. }
        ));
    }

    #[test]
    fn typed_set_rejects_kind_changes() {
        let mut params = ParamSet::new().with(Param::float("gain", 1.0));
        assert!(!params.set("gain", ParamValue::Bool(true)));
        assert!(params.set("gain", ParamValue::Float(0.5)));
    }

    #[test]
    fn uniform_bytes_use_sixteen_byte_slots() {
        let params = ParamSet::new()
            .with(Param::float("a", 3.0))
            .with(Param::new("m", ParamValue::Mat4([1.0; 16])))
            .with(Param::new("b", ParamValue::Vec3([1.0, 2.0, 4.0])));
        let bytes = params.to_uniform_bytes();
        assert_eq!(bytes.len(), 16 + 64 + 16);
        let floats: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(floats[0], 3.0);
        assert_eq!(floats[20..23], [1.0, 2.0, 4.0]);
    }
}
