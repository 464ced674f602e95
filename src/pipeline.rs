//! The per-frame driver.
//!
//! [`Engine`] owns every operation, seed and texture, the [`Graph`] that
//! connects them, and the readback ring. It is the single entry point an editor
//! or a headless host talks to: topology edits go through it so resources stay
//! in step with the graph, and [`iterate`](Engine::iterate) renders one frame.
//!
//! # Example
//!
//! ```
//! use feedloop::{Engine, OperationDesc, RenderingConfig, SeedKind, ShaderSource, SoftwareBackend};
//!
//! let mut backend = SoftwareBackend::new();
//! backend.register_kernel("invert", |ctx, x, y| {
//!     let [r, g, b, a] = ctx.input(x, y);
//!     [1.0 - r, 1.0 - g, 1.0 - b, a]
//! });
//!
//! let mut engine = Engine::new(backend, RenderingConfig::new().size(4, 4))?;
//! let seed = engine.add_seed(SeedKind::GrayscaleNoise, true);
//! let invert = engine.add_operation(OperationDesc::new(
//!     "invert",
//!     ShaderSource::fragment_only("invert"),
//! ));
//! assert!(engine.connect(seed, invert, 1.0));
//! engine.set_output(Some(invert));
//!
//! engine.iterate()?;
//! let frame = engine.output_image()?;
//! assert_eq!(frame.dimensions(), (4, 4));
//! # Ok::<(), feedloop::FeedError>(())
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use image::RgbaImage;

use crate::blend::Blender;
use crate::config::RenderingConfig;
use crate::error::{FeedError, FeedResult};
use crate::gpu::{CommandScope, GpuBackend, PixelFormat};
use crate::graph::{EdgeKind, Graph, GraphEvent, NodeId, NodeKind};
use crate::operation::{FrameInfo, Operation, OperationDesc, ParamValue, ShaderSource};
use crate::readback::Readback;
use crate::seed::{Seed, SeedKind};
use crate::texture::{TextureHandle, TextureManager};

pub struct Engine<B: GpuBackend> {
    gpu: B,
    textures: TextureManager,
    graph: Graph,
    operations: BTreeMap<NodeId, Operation>,
    seeds: BTreeMap<NodeId, Seed>,
    blender: Blender,
    readback: Readback,
    iteration: u64,
    started: Instant,
}

impl<B: GpuBackend> Engine<B> {
    /// Validate `config` and build an empty engine on `gpu`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Config`] when the configuration is out of range.
    pub fn new(mut gpu: B, config: RenderingConfig) -> FeedResult<Self> {
        config.validate()?;
        let mut textures = TextureManager::new(config.clone());
        let blender = {
            let mut scope = CommandScope::new(&mut gpu);
            Blender::new(&mut *scope, &mut textures, config.max_blend_layers)
        };
        tracing::info!(
            backend = gpu.name(),
            width = config.width,
            height = config.height,
            format = ?config.format,
            "engine created"
        );
        Ok(Self {
            gpu,
            textures,
            graph: Graph::new(),
            operations: BTreeMap::new(),
            seeds: BTreeMap::new(),
            blender,
            readback: Readback::new(config.readback_buffers),
            iteration: 0,
            started: Instant::now(),
        })
    }

    /// Current global rendering configuration.
    pub fn config(&self) -> &RenderingConfig {
        self.textures.config()
    }

    /// The backend the engine renders on.
    pub fn backend(&self) -> &B {
        &self.gpu
    }

    /// Mutable access to the backend, e.g. to register kernels after creation.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.gpu
    }

    /// Read-only view of the topology.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Read-only view of the texture table.
    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    /// Operation state for `id`, or `None` for seeds and unknown ids.
    pub fn operation(&self, id: NodeId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    /// Seed state for `id`.
    pub fn seed(&self, id: NodeId) -> Option<&Seed> {
        self.seeds.get(&id)
    }

    // ---- registration -------------------------------------------------------

    /// Register an operation. Its shader is compiled right away; a link failure
    /// leaves it as a pass-through with [`Operation::shader_error`] set.
    pub fn add_operation(&mut self, desc: OperationDesc) -> NodeId {
        let id = self.graph.add_operation();
        let mut gpu = CommandScope::new(&mut self.gpu);
        let op = Operation::new(&mut *gpu, &mut self.textures, desc);
        tracing::debug!(%id, name = op.name(), "operation registered");
        self.operations.insert(id, op);
        id
    }

    /// Register a seed of `kind`. A fixed seed keeps its first frame.
    pub fn add_seed(&mut self, kind: SeedKind, fixed: bool) -> NodeId {
        let id = self.graph.add_seed();
        let mut gpu = CommandScope::new(&mut self.gpu);
        let seed = Seed::new(&mut *gpu, &mut self.textures, kind, fixed);
        tracing::debug!(%id, kind = seed.kind().name(), "seed registered");
        self.seeds.insert(id, seed);
        id
    }

    /// Load an image file as a static seed.
    pub fn add_image_seed(&mut self, path: impl AsRef<Path>, fixed: bool) -> FeedResult<NodeId> {
        let path = path.as_ref();
        let img = image::open(path)?.to_rgba8();
        let id = self.add_seed(SeedKind::Image(img), fixed);
        if let Some(seed) = self.seeds.get_mut(&id) {
            seed.set_path(path.to_path_buf());
        }
        Ok(id)
    }

    /// Remove an operation, its edges and its textures.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if !self.graph.remove_node(id) {
            return false;
        }
        if let Some(op) = self.operations.remove(&id) {
            let mut gpu = CommandScope::new(&mut self.gpu);
            op.destroy(&mut *gpu, &mut self.textures);
        }
        self.sync_blit_targets();
        true
    }

    /// Remove a seed, its outgoing edges and its texture.
    pub fn remove_seed(&mut self, id: NodeId) -> bool {
        if !self.graph.remove_seed(id) {
            return false;
        }
        if let Some(seed) = self.seeds.remove(&id) {
            let mut gpu = CommandScope::new(&mut self.gpu);
            seed.destroy(&mut *gpu, &mut self.textures);
        }
        true
    }

    /// Project reset: every node and its resources go away.
    pub fn clear(&mut self) {
        let mut gpu = CommandScope::new(&mut self.gpu);
        for (_, op) in std::mem::take(&mut self.operations) {
            op.destroy(&mut *gpu, &mut self.textures);
        }
        for (_, seed) in std::mem::take(&mut self.seeds) {
            seed.destroy(&mut *gpu, &mut self.textures);
        }
        if let Err(err) = self.readback.reset(&mut *gpu) {
            tracing::warn!(%err, "readback reset failed");
        }
        self.graph.clear();
        self.iteration = 0;
        tracing::info!("engine cleared");
    }

    // ---- topology -----------------------------------------------------------

    /// Add an edge `source -> dest` with blend `weight`. The edge kind follows
    /// the source: seeds produce [`EdgeKind::Seed`], operations
    /// [`EdgeKind::Normal`]. Returns `false` for self loops, duplicates, unknown
    /// ids or edges into a seed.
    pub fn connect(&mut self, source: NodeId, dest: NodeId, weight: f32) -> bool {
        self.graph.connect(source, dest, weight)
    }

    /// Remove the edge `source -> dest`, freeing the source's blit snapshot if
    /// nothing else reads it through a blit edge.
    pub fn disconnect(&mut self, source: NodeId, dest: NodeId) -> bool {
        let removed = self.graph.disconnect(source, dest);
        if removed {
            self.sync_blit_targets();
        }
        removed
    }

    /// Switch an operation-to-operation edge between `Normal` and `Blit`.
    /// Seed edges cannot change kind.
    pub fn set_edge_type(&mut self, source: NodeId, dest: NodeId, kind: EdgeKind) -> bool {
        let changed = self.graph.set_edge_type(source, dest, kind);
        if changed {
            self.sync_blit_targets();
        }
        changed
    }

    /// Set the blend weight of an existing edge.
    pub fn set_blend_factor(&mut self, source: NodeId, dest: NodeId, weight: f32) -> bool {
        self.graph.set_blend_factor(source, dest, weight)
    }

    /// Blend weight of the edge `source -> dest`, if it exists.
    pub fn blend_factor(&self, source: NodeId, dest: NodeId) -> Option<f32> {
        self.graph.blend_factor(source, dest)
    }

    /// Give every input of `dest` the weight `1 / input count`.
    pub fn equalize_blend_factors(&mut self, dest: NodeId) -> bool {
        self.graph.equalize_blend_factors(dest)
    }

    /// Select the node whose texture is read back, or `None` for black output.
    pub fn set_output(&mut self, id: Option<NodeId>) -> bool {
        self.graph.set_output(id)
    }

    /// The selected output node.
    pub fn output_node(&self) -> Option<NodeId> {
        self.graph.output()
    }

    /// Texture holding the selected output, if any.
    pub fn output_texture(&self) -> Option<TextureHandle> {
        let id = self.graph.output()?;
        match self.graph.node(id)?.kind() {
            NodeKind::Operation => self.operations.get(&id).map(Operation::out_texture),
            NodeKind::Seed => self.seeds.get(&id).map(Seed::texture),
        }
    }

    /// Operations in execution order.
    pub fn order(&self) -> &[NodeId] {
        self.graph.order()
    }

    /// Operations skipped because they sit on (or behind) an all-`Normal` cycle.
    pub fn excluded_nodes(&self) -> &[NodeId] {
        self.graph.excluded()
    }

    /// Take the graph events queued since the last call.
    pub fn drain_events(&mut self) -> Vec<GraphEvent> {
        self.graph.drain_events()
    }

    /// Allocate snapshot targets for operations read through blit edges, and
    /// free the ones no longer read that way.
    fn sync_blit_targets(&mut self) {
        let mut gpu = CommandScope::new(&mut self.gpu);
        for (id, op) in &mut self.operations {
            let wanted = self.graph.has_blit_output(*id);
            op.set_blit_enabled(&mut *gpu, &mut self.textures, wanted);
        }
    }

    // ---- operation state ----------------------------------------------------

    /// Scalar parameter write (`name` or `name.x` style), clamped to range.
    pub fn set_parameter(&mut self, id: NodeId, name: &str, value: f32) -> bool {
        self.operations
            .get_mut(&id)
            .is_some_and(|op| op.params_mut().set_scalar(name, value))
    }

    /// Replace a whole parameter value. Fails on unknown names and on a value
    /// of a different type than the declared one.
    pub fn set_parameter_value(&mut self, id: NodeId, name: &str, value: ParamValue) -> bool {
        self.operations
            .get_mut(&id)
            .is_some_and(|op| op.params_mut().set(name, value))
    }

    /// Enable or disable an operation. Disabled operations pass their input
    /// through unchanged.
    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> bool {
        match self.operations.get_mut(&id) {
            Some(op) => {
                op.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Replace an operation's shader. Returns whether the new program linked; if
    /// not, the operation renders as a pass-through until a working shader is set.
    pub fn set_shader(&mut self, id: NodeId, shader: ShaderSource) -> FeedResult<bool> {
        let op = self
            .operations
            .get_mut(&id)
            .ok_or(FeedError::UnknownNode(id))?;
        let mut gpu = CommandScope::new(&mut self.gpu);
        op.set_shader(&mut *gpu, shader);
        Ok(op.shader_error().is_none())
    }

    /// Freeze (`true`) or unfreeze a seed. Unfixed noise seeds regenerate every
    /// tick. Returns `false` when `id` is not a seed.
    pub fn set_seed_fixed(&mut self, id: NodeId, fixed: bool) -> bool {
        match self.seeds.get_mut(&id) {
            Some(seed) => {
                seed.set_fixed(fixed);
                true
            }
            None => false,
        }
    }

    /// Queue a captured frame for a camera seed. Uploaded at the next tick.
    pub fn push_camera_frame(&mut self, id: NodeId, frame: RgbaImage) -> bool {
        self.seeds
            .get_mut(&id)
            .is_some_and(|seed| seed.push_frame(frame))
    }

    // ---- global state -------------------------------------------------------

    /// Change the working resolution. Every texture is reallocated and keeps its
    /// contents; operations receive the new orthographic bounds.
    #[tracing::instrument(skip(self))]
    pub fn resize(&mut self, width: u32, height: u32) -> FeedResult<()> {
        if width == 0 || height == 0 {
            return Err(FeedError::config(format!(
                "resolution must be non-zero, got {width}x{height}"
            )));
        }
        let mut gpu = CommandScope::new(&mut self.gpu);
        let bounds = self.textures.resize(&mut *gpu, width, height);
        for op in self.operations.values_mut() {
            op.set_bounds(bounds);
        }
        for seed in self.seeds.values_mut() {
            if matches!(seed.kind(), SeedKind::Image(_)) {
                seed.fill(&mut *gpu, &self.textures)?;
            }
        }
        self.readback.reset(&mut *gpu)?;
        Ok(())
    }

    /// Change the storage format of every render target, preserving contents.
    #[tracing::instrument(skip(self))]
    pub fn set_format(&mut self, format: PixelFormat) {
        let mut gpu = CommandScope::new(&mut self.gpu);
        self.textures.set_format(&mut *gpu, format);
    }

    // ---- per frame ----------------------------------------------------------

    /// Render one frame.
    ///
    /// A node whose GPU work fails is logged and skipped; the rest of the graph
    /// still renders and the iteration counter always advances.
    #[tracing::instrument(skip(self), fields(iteration = self.iteration))]
    pub fn iterate(&mut self) -> FeedResult<()> {
        let mut gpu = CommandScope::new(&mut self.gpu);
        let textures = &self.textures;

        for (id, seed) in &mut self.seeds {
            match seed.apply_pending(&mut *gpu, textures) {
                Ok(true) => tracing::trace!(%id, "camera frame uploaded"),
                Ok(false) => {}
                Err(err) => tracing::warn!(%id, %err, "camera frame upload failed"),
            }
        }

        let order = self.graph.order();
        if !order.is_empty() {
            for (id, op) in &self.operations {
                if let Err(err) = op.snapshot(&mut *gpu, textures) {
                    tracing::warn!(%id, %err, "blit snapshot failed");
                }
            }
        }

        let frame = FrameInfo {
            resolution: [textures.config().width as f32, textures.config().height as f32],
            time: self.started.elapsed().as_secs_f32(),
            iteration: self.iteration as u32,
            filter: textures.config().default_filter,
        };
        for &id in order {
            let Some(op) = self.operations.get(&id) else {
                continue;
            };
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let inputs: Vec<(TextureHandle, f32)> = node
                .inputs()
                .iter()
                .filter_map(|(source, edge)| {
                    let texture = match edge.kind {
                        EdgeKind::Normal => self.operations.get(source).map(Operation::out_texture),
                        EdgeKind::Blit => self
                            .operations
                            .get(source)
                            .map(|src| src.blit_texture().unwrap_or(src.out_texture())),
                        EdgeKind::Seed => self.seeds.get(source).map(Seed::texture),
                    };
                    texture.map(|t| (t, edge.blend))
                })
                .collect();

            let input = match inputs.as_slice() {
                [] => None,
                [(single, _)] => Some(*single),
                _ => {
                    let filter = op.desc().filter.unwrap_or(frame.filter);
                    if let Err(err) =
                        self.blender
                            .blend(&mut *gpu, textures, &inputs, op.in_texture(), filter)
                    {
                        tracing::warn!(%id, %err, "input blend failed, node skipped");
                        continue;
                    }
                    Some(op.in_texture())
                }
            };
            if let Err(err) = op.render(&mut *gpu, textures, input, frame) {
                tracing::warn!(%id, name = op.name(), %err, "render failed, node skipped");
            }
        }

        for (id, seed) in &mut self.seeds {
            if let Err(err) = seed.advance(&mut *gpu, textures) {
                tracing::warn!(%id, %err, "seed advance failed");
            }
        }

        self.iteration += 1;
        Ok(())
    }

    /// Frames rendered since creation (or the last [`clear`](Self::clear)).
    pub fn iteration_number(&self) -> u64 {
        self.iteration
    }

    /// The output as a host RGBA8 image, through the readback ring. Black when
    /// no output is selected.
    pub fn output_image(&mut self) -> FeedResult<RgbaImage> {
        let output = self.output_texture();
        let mut gpu = CommandScope::new(&mut self.gpu);
        Ok(self.readback.read(&mut *gpu, &mut self.textures, output)?)
    }

    /// Synchronous read of one output pixel.
    pub fn sample_pixel(&mut self, x: u32, y: u32) -> FeedResult<[u8; 4]> {
        let output = self.output_texture();
        let mut gpu = CommandScope::new(&mut self.gpu);
        Ok(self
            .readback
            .sample_pixel(&mut *gpu, &mut self.textures, output, x, y)?)
    }

    pub(crate) fn operations(&self) -> impl Iterator<Item = (NodeId, &Operation)> {
        self.operations.iter().map(|(id, op)| (*id, op))
    }

    pub(crate) fn seeds(&self) -> impl Iterator<Item = (NodeId, &Seed)> {
        self.seeds.iter().map(|(id, seed)| (*id, seed))
    }
}
