//! Multi-input weighted blending.
//!
//! When an operation has more than one live input, every input is copied into
//! one layer of a shared layered texture and a single blend pass sums the
//! layers with a per-layer weight vector. Layers past the input count carry a
//! zero weight; inputs past the texture's layer count are dropped.

use crate::error::GpuResult;
use crate::gpu::{DrawCall, FilterMode, GpuBackend, ProgramDesc, ProgramLayout, RawProgram};
use crate::texture::{TextureHandle, TextureManager};

/// Program label of the built-in blend pass.
pub const BLEND_PROGRAM_LABEL: &str = "feedloop.blend";

/// Weights are packed four to a `vec4f`, which caps the layer count at 16.
pub const BLEND_SHADER: &str = r#"
struct BlendUniforms {
    weights: array<vec4f, 4>,
    count: u32,
}

@group(0) @binding(0) var<uniform> u: BlendUniforms;
@group(0) @binding(1) var layers: texture_2d_array<f32>;
@group(0) @binding(2) var input_sampler: sampler;

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
    var color = vec4f(0.0);
    let count = min(u.count, textureNumLayers(layers));
    for (var i = 0u; i < count; i++) {
        let w = u.weights[i / 4u][i % 4u];
        color += w * textureSampleLevel(layers, input_sampler, in.uv, i, 0.0);
    }
    return color;
}
"#;

/// Uniform block of the blend pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlendUniforms {
    pub weights: [[f32; 4]; 4],
    pub count: u32,
    pub _pad: [u32; 3],
}

impl BlendUniforms {
    pub fn new(weights: &[f32]) -> Self {
        let mut uniforms = Self {
            weights: [[0.0; 4]; 4],
            count: 0,
            _pad: [0; 3],
        };
        for (i, &w) in weights.iter().take(16).enumerate() {
            uniforms.weights[i / 4][i % 4] = w;
            uniforms.count += 1;
        }
        uniforms
    }

    pub fn weight(&self, layer: usize) -> f32 {
        if layer >= 16 {
            return 0.0;
        }
        self.weights[layer / 4][layer % 4]
    }
}

/// Owner of the shared layered blend texture and the blend program.
pub struct Blender {
    texture: TextureHandle,
    program: Option<RawProgram>,
    capacity: u32,
}

impl Blender {
    pub fn new(gpu: &mut dyn GpuBackend, textures: &mut TextureManager, capacity: u32) -> Self {
        let texture = textures.create_array_texture(gpu, "blend layers", capacity);
        let program = match gpu.create_program(&ProgramDesc {
            label: BLEND_PROGRAM_LABEL,
            vertex: BLEND_SHADER,
            fragment: BLEND_SHADER,
            layout: ProgramLayout::Layered,
        }) {
            Ok(program) => Some(program),
            Err(err) => {
                tracing::warn!(%err, "blend program unavailable, multi-input nodes use their first input");
                None
            }
        };
        Self {
            texture,
            program,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Blend `inputs` (source texture, weight) into `target`. Returns how many
    /// inputs took part.
    pub fn blend(
        &self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
        inputs: &[(TextureHandle, f32)],
        target: TextureHandle,
        filter: FilterMode,
    ) -> GpuResult<usize> {
        let Some(target_raw) = textures.raw(target) else {
            return Ok(0);
        };
        let used = inputs.len().min(self.capacity as usize);
        if used < inputs.len() {
            tracing::debug!(
                dropped = inputs.len() - used,
                capacity = self.capacity,
                "blend inputs beyond layer capacity dropped"
            );
        }
        let inputs = &inputs[..used];

        let (Some(program), Some(layers)) = (self.program, textures.raw(self.texture)) else {
            // Degraded path: no blend program or no layer texture.
            return match inputs.first() {
                Some(&(source, _)) => textures.blit(gpu, source, target).map(|_| 1),
                None => gpu.clear(target_raw, 0, [0.0; 4]).map(|_| 0),
            };
        };

        for (layer, &(source, _)) in inputs.iter().enumerate() {
            let layer = layer as u32;
            if textures.raw(source).is_some() {
                textures.copy_to_layer(gpu, source, self.texture, layer)?;
            } else {
                textures.clear_array_layer(gpu, self.texture, layer)?;
            }
        }

        let weights: Vec<f32> = inputs.iter().map(|&(_, w)| w).collect();
        let uniforms = BlendUniforms::new(&weights);
        gpu.draw(&DrawCall {
            program,
            input: Some(layers),
            previous: None,
            target: target_raw,
            uniforms: bytemuck::bytes_of(&uniforms),
            filter,
        })?;
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderingConfig;
    use crate::gpu::SoftwareBackend;

    #[test]
    fn uniforms_pack_four_per_vector() {
        let u = BlendUniforms::new(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(u.count, 5);
        assert_eq!(u.weights[1][0], 0.5);
        assert_eq!(u.weight(4), 0.5);
        assert_eq!(u.weight(5), 0.0);
        assert_eq!(std::mem::size_of::<BlendUniforms>(), 80);
    }

    #[test]
    fn blends_weighted_inputs() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = TextureManager::new(
            RenderingConfig::new()
                .size(2, 2)
                .format(crate::gpu::PixelFormat::Rgba16Float),
        );
        let red = textures.create_texture(&mut gpu, "red");
        let blue = textures.create_texture(&mut gpu, "blue");
        let out = textures.create_texture(&mut gpu, "out");
        textures.fill(&mut gpu, red, [1.0, 0.0, 0.0, 1.0]).unwrap();
        textures.fill(&mut gpu, blue, [0.0, 0.0, 1.0, 1.0]).unwrap();
        let blender = Blender::new(&mut gpu, &mut textures, 4);

        let used = blender
            .blend(
                &mut gpu,
                &textures,
                &[(red, 0.25), (blue, 0.75)],
                out,
                FilterMode::Nearest,
            )
            .unwrap();

        assert_eq!(used, 2);
        let texel = gpu.texels(textures.raw(out).unwrap(), 0).unwrap()[0];
        assert_eq!(texel, [0.25, 0.0, 0.75, 1.0]);
    }

    #[test]
    fn drops_inputs_past_capacity() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = TextureManager::new(RenderingConfig::new().size(1, 1));
        let inputs: Vec<_> = (0..3)
            .map(|i| (textures.create_texture(&mut gpu, &format!("in{i}")), 1.0))
            .collect();
        let out = textures.create_texture(&mut gpu, "out");
        let blender = Blender::new(&mut gpu, &mut textures, 2);

        let used = blender
            .blend(&mut gpu, &textures, &inputs, out, FilterMode::Linear)
            .unwrap();
        assert_eq!(used, 2);
    }
}
