use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use feedloop::{
    EdgeKind, Engine, FeedError, GpuBackend, GpuContext, GraphSnapshot, OperationDesc, Param,
    ParamValue, PixelFormat, RenderingConfig, SeedKind, ShaderSource, SoftwareBackend,
    UNIFORM_HEADER_FLOATS,
};

const WARP_SHADER: &str = include_str!("shaders/warp.wgsl");
const FADE_SHADER: &str = include_str!("shaders/fade.wgsl");

/// Render a feedback graph headlessly and write the output as a PNG.
#[derive(Parser, Debug)]
#[command(name = "feedloop", version)]
struct Cli {
    /// Working resolution width.
    #[arg(long, default_value_t = 512)]
    width: u32,

    /// Working resolution height.
    #[arg(long, default_value_t = 512)]
    height: u32,

    /// Render target format.
    #[arg(long, value_enum, default_value_t = FormatChoice::Rgba8)]
    format: FormatChoice,

    /// Number of iterations to run before reading the output.
    #[arg(long, default_value_t = 120)]
    frames: u32,

    /// Backend to use.
    #[arg(long, value_enum, default_value_t = BackendChoice::Gpu)]
    backend: BackendChoice,

    /// Load the graph from a snapshot instead of building the demo graph.
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Write the graph that was rendered as a snapshot.
    #[arg(long)]
    save_graph: Option<PathBuf>,

    /// Seed image for the demo graph; colour noise when omitted.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Output PNG path.
    #[arg(long, default_value = "feedloop.png")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatChoice {
    Rgba8,
    Rgba16f,
}

impl From<FormatChoice> for PixelFormat {
    fn from(choice: FormatChoice) -> Self {
        match choice {
            FormatChoice::Rgba8 => PixelFormat::Rgba8Unorm,
            FormatChoice::Rgba16f => PixelFormat::Rgba16Float,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    Gpu,
    Cpu,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = RenderingConfig::new()
        .size(cli.width, cli.height)
        .format(cli.format.into());

    match cli.backend {
        BackendChoice::Gpu => {
            let gpu = GpuContext::headless().context("failed to open a GPU device")?;
            tracing::info!(adapter = gpu.adapter_name(), "using wgpu backend");
            run(Engine::new(gpu, config)?, &cli)
        }
        BackendChoice::Cpu => run(Engine::new(software_backend(), config)?, &cli),
    }
}

fn run<B: GpuBackend>(mut engine: Engine<B>, cli: &Cli) -> anyhow::Result<()> {
    match &cli.graph {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            engine.load_snapshot(&GraphSnapshot::from_json(&json)?)?;
        }
        None => build_demo(&mut engine, cli)?,
    }

    let excluded = engine.excluded_nodes();
    if !excluded.is_empty() {
        tracing::warn!(?excluded, "nodes on a feedback cycle without a blit edge are skipped");
    }

    let started = std::time::Instant::now();
    for _ in 0..cli.frames {
        engine.iterate()?;
    }
    tracing::info!(
        frames = cli.frames,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "iterations finished"
    );

    engine
        .output_image()?
        .save(&cli.out)
        .with_context(|| format!("writing {}", cli.out.display()))?;
    tracing::info!(path = %cli.out.display(), "output written");

    if let Some(path) = &cli.save_graph {
        std::fs::write(path, engine.snapshot().to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

/// seed ─▶ warp ─▶ fade, with fade fed back into warp through a blit edge.
fn build_demo<B: GpuBackend>(engine: &mut Engine<B>, cli: &Cli) -> Result<(), FeedError> {
    let seed = match &cli.image {
        Some(path) => engine.add_image_seed(path, true)?,
        None => engine.add_seed(SeedKind::ColorNoise, true),
    };
    let warp = engine.add_operation(
        OperationDesc::new("warp", ShaderSource::fragment_only(WARP_SHADER))
            .with_param(Param::new("warp", ParamValue::Vec2([0.02, 1.01]))),
    );
    let fade = engine.add_operation(
        OperationDesc::new("fade", ShaderSource::fragment_only(FADE_SHADER))
            .with_param(Param::float("decay", 0.98).with_range(0.0, 1.0)),
    );

    engine.connect(seed, warp, 0.05);
    engine.connect(warp, fade, 1.0);
    engine.connect(fade, warp, 0.95);
    engine.set_edge_type(fade, warp, EdgeKind::Blit);
    engine.set_output(Some(fade));
    Ok(())
}

/// CPU backend with kernels standing in for the bundled shaders.
fn software_backend() -> SoftwareBackend {
    let mut backend = SoftwareBackend::new();
    backend.register_kernel(WARP_SHADER, |ctx, x, y| {
        let (w, h) = (ctx.width() as f32, ctx.height() as f32);
        let angle = ctx.param(0);
        let zoom = ctx
            .uniform_f32(UNIFORM_HEADER_FLOATS + 1)
            .max(0.001);
        let aspect = w / h;
        let px = ((x as f32 + 0.5) / w - 0.5) * aspect;
        let py = (y as f32 + 0.5) / h - 0.5;
        let (s, c) = angle.sin_cos();
        let rx = (c * px + s * py) / zoom / aspect + 0.5;
        let ry = (-s * px + c * py) / zoom + 0.5;
        let sx = (rx.rem_euclid(1.0) * w) as u32;
        let sy = (ry.rem_euclid(1.0) * h) as u32;
        ctx.input(sx.min(ctx.width() - 1), sy.min(ctx.height() - 1))
    });
    backend.register_kernel(FADE_SHADER, |ctx, x, y| {
        let [r, g, b, _] = ctx.input(x, y);
        let decay = ctx.param(0);
        let mix = |a: f32, b: f32| (a + (b - a) * 0.02) * decay;
        [mix(r, g), mix(g, b), mix(b, r), 1.0]
    });
    backend
}
