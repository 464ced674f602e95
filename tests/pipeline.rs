use feedloop::{
    EdgeKind, Engine, FeedError, GraphSnapshot, NodeId, OperationDesc, Param, ParamValue,
    PixelFormat, RenderingConfig, SeedKind, ShaderSource, SoftwareBackend,
};
use image::{Rgba, RgbaImage};

const PASS: &str = "pass";
const INVERT: &str = "invert";
const BRIGHTEN: &str = "brighten";
const GAIN: &str = "gain";
const PREVIOUS_INPUT: &str = "previous input";
const WEDGED: &str = "wedged";

fn backend() -> SoftwareBackend {
    let mut backend = SoftwareBackend::new();
    backend.register_kernel(PASS, |ctx, x, y| ctx.input(x, y));
    backend.register_kernel(INVERT, |ctx, x, y| {
        let [r, g, b, a] = ctx.input(x, y);
        [1.0 - r, 1.0 - g, 1.0 - b, a]
    });
    backend.register_kernel(BRIGHTEN, |ctx, x, y| {
        let [r, g, b, _] = ctx.input(x, y);
        [r + 0.125, g + 0.125, b + 0.125, 1.0]
    });
    backend.register_kernel(GAIN, |ctx, x, y| {
        let gain = ctx.param(0);
        let [r, g, b, a] = ctx.input(x, y);
        [r * gain, g * gain, b * gain, a]
    });
    backend.register_kernel(PREVIOUS_INPUT, |ctx, x, y| ctx.layer(1, x, y));
    backend.register_kernel(WEDGED, |ctx, x, y| ctx.input(x, y));
    backend.fail_draws(WEDGED);
    backend
}

fn engine(width: u32, height: u32) -> Engine<SoftwareBackend> {
    Engine::new(backend(), RenderingConfig::new().size(width, height)).unwrap()
}

fn op(name: &str) -> OperationDesc {
    OperationDesc::new(name, ShaderSource::fragment_only(name))
}

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> SeedKind {
    SeedKind::Image(RgbaImage::from_pixel(width, height, Rgba(rgba)))
}

fn out_texels(engine: &Engine<SoftwareBackend>, id: NodeId) -> Vec<[f32; 4]> {
    let handle = engine.operation(id).unwrap().out_texture();
    let raw = engine.textures().raw(handle).unwrap();
    engine.backend().texels(raw, 0).unwrap()
}

#[test]
fn seed_through_one_operation() {
    let mut engine = engine(4, 4);
    let seed = engine.add_seed(solid(4, 4, [255, 0, 0, 255]), true);
    let invert = engine.add_operation(op(INVERT));
    engine.connect(seed, invert, 1.0);
    engine.set_output(Some(invert));

    engine.iterate().unwrap();

    let img = engine.output_image().unwrap();
    assert_eq!(img.dimensions(), (4, 4));
    assert!(img.pixels().all(|p| p.0 == [0, 255, 255, 255]));
    assert_eq!(engine.iteration_number(), 1);
}

#[test]
fn multiple_inputs_are_blended_by_weight() {
    let mut engine = engine(2, 2);
    let red = engine.add_seed(solid(2, 2, [255, 0, 0, 255]), true);
    let blue = engine.add_seed(solid(2, 2, [0, 0, 255, 255]), true);
    let pass = engine.add_operation(op(PASS));
    engine.connect(red, pass, 0.5);
    engine.connect(blue, pass, 0.5);
    engine.set_output(Some(pass));

    engine.iterate().unwrap();

    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [128, 0, 128, 255]);
}

#[test]
fn blit_edge_reads_the_previous_frame() {
    let mut engine = engine(2, 2);
    let a = engine.add_operation(op(BRIGHTEN));
    let b = engine.add_operation(op(PASS));
    engine.connect(a, b, 1.0);
    engine.connect(b, a, 1.0);
    assert!(engine.set_edge_type(b, a, EdgeKind::Blit));
    assert!(engine.operation(b).unwrap().blit_texture().is_some());
    engine.set_output(Some(b));

    for _ in 0..3 {
        engine.iterate().unwrap();
    }

    assert_eq!(engine.sample_pixel(1, 1).unwrap(), [96, 96, 96, 255]);
}

#[test]
fn feedback_node_runs_once_per_tick() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(SeedKind::GrayscaleNoise, true);
    let b = engine.add_operation(op(PASS));
    let c = engine.add_operation(op(PASS));
    engine.connect(seed, b, 0.5);
    engine.connect(b, c, 1.0);
    engine.connect(c, b, 0.5);
    engine.set_edge_type(c, b, EdgeKind::Blit);

    assert_eq!(engine.order(), &[b, c]);

    let before = engine.backend().stats().draws;
    engine.iterate().unwrap();
    // One blend pass plus one draw each for b and c.
    assert_eq!(engine.backend().stats().draws - before, 3);
}

#[test]
fn operations_on_a_normal_cycle_are_skipped() {
    let mut engine = engine(2, 2);
    let a = engine.add_operation(op(PASS));
    let b = engine.add_operation(op(PASS));
    engine.connect(a, b, 1.0);
    engine.connect(b, a, 1.0);

    assert!(engine.order().is_empty());
    assert_eq!(engine.excluded_nodes(), &[a, b]);
    engine.iterate().unwrap();
    assert_eq!(engine.backend().stats().draws, 0);
}

#[test]
fn resize_round_trip_preserves_contents() {
    let mut engine = engine(4, 4);
    let seed = engine.add_seed(SeedKind::ColorNoise, true);
    let pass = engine.add_operation(op(PASS));
    engine.connect(seed, pass, 1.0);
    engine.iterate().unwrap();
    let before = out_texels(&engine, pass);

    engine.resize(8, 4).unwrap();
    assert_eq!(engine.config().width, 8);
    assert_eq!(out_texels(&engine, pass).len(), 32);
    let bounds = engine.operation(pass).unwrap().bounds();
    assert_eq!((bounds.left, bounds.right, bounds.top), (-2.0, 2.0, 1.0));

    engine.resize(4, 4).unwrap();
    assert_eq!(out_texels(&engine, pass), before);
}

#[test]
fn zero_resize_is_rejected() {
    let mut engine = engine(4, 4);
    assert!(matches!(engine.resize(0, 4), Err(FeedError::Config(_))));
    assert_eq!(engine.config().width, 4);
}

#[test]
fn removing_the_output_reads_black() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [255, 255, 255, 255]), true);
    let pass = engine.add_operation(op(PASS));
    engine.connect(seed, pass, 1.0);
    engine.set_output(Some(pass));
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [255, 255, 255, 255]);

    assert!(engine.remove_node(pass));
    engine.iterate().unwrap();

    let img = engine.output_image().unwrap();
    assert_eq!(img.dimensions(), (2, 2));
    assert!(img.pixels().all(|p| p.0 == [0, 0, 0, 255]));
}

#[test]
fn broken_shader_falls_back_to_pass_through() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [255, 0, 0, 255]), true);
    let invert = engine.add_operation(op(INVERT));
    engine.connect(seed, invert, 1.0);
    engine.set_output(Some(invert));

    let linked = engine
        .set_shader(invert, ShaderSource::fragment_only("not a shader"))
        .unwrap();
    assert!(!linked);
    assert!(engine.operation(invert).unwrap().shader_error().is_some());

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [255, 0, 0, 255]);

    assert!(
        engine
            .set_shader(invert, ShaderSource::fragment_only(INVERT))
            .unwrap()
    );
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 255, 255, 255]);
}

#[test]
fn set_shader_on_unknown_node_fails() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(SeedKind::Camera, false);
    assert!(matches!(
        engine.set_shader(seed, ShaderSource::fragment_only(PASS)),
        Err(FeedError::UnknownNode(id)) if id == seed
    ));
}

#[test]
fn disabled_operation_passes_input_through() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [0, 255, 0, 255]), true);
    let invert = engine.add_operation(op(INVERT));
    engine.connect(seed, invert, 1.0);
    engine.set_output(Some(invert));
    assert!(engine.set_enabled(invert, false));

    engine.iterate().unwrap();

    assert_eq!(engine.sample_pixel(1, 0).unwrap(), [0, 255, 0, 255]);
    assert!(engine.operation(invert).unwrap().is_pass_through());
}

#[test]
fn parameters_are_clamped_and_reach_the_program() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [200, 100, 50, 255]), true);
    let gain = engine.add_operation(
        op(GAIN).with_param(Param::float("gain", 0.5).with_range(0.0, 1.0)),
    );
    engine.connect(seed, gain, 1.0);
    engine.set_output(Some(gain));

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [100, 50, 25, 255]);

    assert!(engine.set_parameter(gain, "gain", 4.0));
    assert!(!engine.set_parameter(gain, "missing", 1.0));
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [200, 100, 50, 255]);
}

#[test]
fn history_exposes_the_previous_input() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [0, 0, 255, 255]), true);
    let delayed = engine.add_operation(op(PREVIOUS_INPUT).with_history(2));
    engine.connect(seed, delayed, 1.0);
    engine.set_output(Some(delayed));

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 0, 0, 0]);

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 0, 255, 255]);
}

#[test]
fn history_keeps_shifting_while_disabled() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [0, 0, 255, 255]), true);
    let delayed = engine.add_operation(op(PREVIOUS_INPUT).with_history(2));
    engine.connect(seed, delayed, 1.0);
    engine.set_output(Some(delayed));

    engine.set_enabled(delayed, false);
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 0, 255, 255]);

    // Layer 1 now holds the input seen while the operation was disabled.
    engine.set_enabled(delayed, true);
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 0, 255, 255]);
}

#[test]
fn whole_parameter_values_must_match_the_declared_type() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [200, 100, 50, 255]), true);
    let gain = engine.add_operation(op(GAIN).with_param(Param::float("gain", 1.0)));
    engine.connect(seed, gain, 1.0);
    engine.set_output(Some(gain));

    assert!(engine.set_parameter_value(gain, "gain", ParamValue::Float(0.5)));
    assert!(!engine.set_parameter_value(gain, "gain", ParamValue::Int(2)));
    assert!(!engine.set_parameter_value(gain, "missing", ParamValue::Float(0.5)));
    assert!(!engine.set_parameter_value(seed, "gain", ParamValue::Float(0.5)));
    assert_eq!(
        engine.operation(gain).unwrap().params().get("gain").map(|p| &p.value),
        Some(&ParamValue::Float(0.5))
    );

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [100, 50, 25, 255]);
}

#[test]
fn equalizing_through_the_engine_rebalances_the_blend() {
    let mut engine = engine(2, 2);
    let red = engine.add_seed(solid(2, 2, [255, 0, 0, 255]), true);
    let blue = engine.add_seed(solid(2, 2, [0, 0, 255, 255]), true);
    let pass = engine.add_operation(op(PASS));
    engine.connect(red, pass, 1.0);
    engine.connect(blue, pass, 1.0);
    engine.set_output(Some(pass));

    assert!(engine.equalize_blend_factors(pass));
    assert_eq!(engine.blend_factor(red, pass), Some(0.5));
    assert_eq!(engine.blend_factor(blue, pass), Some(0.5));

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(1, 1).unwrap(), [128, 0, 128, 255]);
}

#[test]
fn inputs_beyond_the_layer_cap_are_dropped() {
    let config = RenderingConfig::new().size(2, 2).max_blend_layers(2);
    let mut engine = Engine::new(backend(), config).unwrap();
    let red = engine.add_seed(solid(2, 2, [255, 0, 0, 255]), true);
    let green = engine.add_seed(solid(2, 2, [0, 255, 0, 255]), true);
    let blue = engine.add_seed(solid(2, 2, [0, 0, 255, 255]), true);
    let pass = engine.add_operation(op(PASS));
    for seed in [red, green, blue] {
        assert!(engine.connect(seed, pass, 1.0));
    }
    engine.set_output(Some(pass));

    engine.iterate().unwrap();

    // Sources are blended in id order; blue is the third and is dropped.
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [255, 255, 0, 255]);
}

#[test]
fn a_failing_node_does_not_abort_the_tick() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(SeedKind::ColorNoise, false);
    let still = engine.add_seed(solid(2, 2, [255, 0, 0, 255]), true);
    let wedged = engine.add_operation(op(WEDGED));
    let invert = engine.add_operation(op(INVERT));
    engine.connect(seed, wedged, 1.0);
    engine.connect(still, invert, 1.0);
    engine.set_output(Some(invert));
    assert_eq!(engine.order(), &[wedged, invert]);
    let noise_texture = engine.seed(seed).unwrap().texture();
    let noise_before = {
        let raw = engine.textures().raw(noise_texture).unwrap();
        engine.backend().texels(raw, 0).unwrap()
    };

    engine.iterate().unwrap();

    assert_eq!(engine.iteration_number(), 1);
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), [0, 255, 255, 255]);
    let raw = engine.textures().raw(noise_texture).unwrap();
    assert_ne!(engine.backend().texels(raw, 0).unwrap(), noise_before);
}

#[test]
fn random_seeds_regenerate_unless_fixed() {
    let mut engine = engine(4, 4);
    let moving = engine.add_seed(SeedKind::ColorNoise, false);
    let still = engine.add_seed(SeedKind::ColorNoise, true);
    let texels = |engine: &Engine<SoftwareBackend>, id| {
        let raw = engine
            .textures()
            .raw(engine.seed(id).unwrap().texture())
            .unwrap();
        engine.backend().texels(raw, 0).unwrap()
    };
    let (moving_before, still_before) = (texels(&engine, moving), texels(&engine, still));

    engine.iterate().unwrap();

    assert_ne!(texels(&engine, moving), moving_before);
    assert_eq!(texels(&engine, still), still_before);
}

#[test]
fn fixing_a_seed_freezes_its_noise() {
    let mut engine = engine(4, 4);
    let seed = engine.add_seed(SeedKind::GrayscaleNoise, false);
    let pass = engine.add_operation(op(PASS));
    engine.connect(seed, pass, 1.0);
    let texels = |engine: &Engine<SoftwareBackend>| {
        let raw = engine
            .textures()
            .raw(engine.seed(seed).unwrap().texture())
            .unwrap();
        engine.backend().texels(raw, 0).unwrap()
    };

    assert!(engine.set_seed_fixed(seed, true));
    assert!(!engine.set_seed_fixed(pass, true));
    let frozen = texels(&engine);
    engine.iterate().unwrap();
    engine.iterate().unwrap();
    assert_eq!(texels(&engine), frozen);

    assert!(engine.set_seed_fixed(seed, false));
    engine.iterate().unwrap();
    assert_ne!(texels(&engine), frozen);
}

#[test]
fn camera_frames_are_uploaded_on_the_next_tick() {
    let mut engine = engine(4, 4);
    let camera = engine.add_seed(SeedKind::Camera, false);
    let pass = engine.add_operation(op(PASS));
    engine.connect(camera, pass, 1.0);
    engine.set_output(Some(pass));

    let frame = RgbaImage::from_pixel(2, 2, Rgba([0, 255, 0, 255]));
    assert!(engine.push_camera_frame(camera, frame.clone()));
    assert!(!engine.push_camera_frame(pass, frame));

    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(2, 2).unwrap(), [0, 255, 0, 255]);
}

#[test]
fn format_change_keeps_output_readable() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(solid(2, 2, [255, 0, 255, 255]), true);
    let pass = engine.add_operation(op(PASS));
    engine.connect(seed, pass, 1.0);
    engine.set_output(Some(pass));
    engine.iterate().unwrap();

    engine.set_format(PixelFormat::Rgba16Float);
    assert_eq!(engine.config().format, PixelFormat::Rgba16Float);

    let img = engine.output_image().unwrap();
    assert!(img.pixels().all(|p| p.0 == [255, 0, 255, 255]));
    engine.iterate().unwrap();
    assert_eq!(engine.sample_pixel(0, 1).unwrap(), [255, 0, 255, 255]);
}

#[test]
fn snapshot_round_trips_through_json() {
    let mut engine = engine(2, 2);
    let seed = engine.add_seed(SeedKind::ColorNoise, true);
    let a = engine.add_operation(op(PASS));
    let b = engine.add_operation(
        op(GAIN).with_param(Param::float("gain", 0.25).with_range(0.0, 1.0)),
    );
    engine.connect(seed, a, 0.5);
    engine.connect(a, b, 1.0);
    engine.connect(b, a, 0.5);
    engine.set_edge_type(b, a, EdgeKind::Blit);
    engine.set_parameter(b, "gain", 0.75);
    engine.set_output(Some(b));
    let snapshot = engine.snapshot();

    let json = snapshot.to_json().unwrap();
    let mut restored = self::engine(2, 2);
    let ids = restored
        .load_snapshot(&GraphSnapshot::from_json(&json).unwrap())
        .unwrap();

    assert_eq!(ids.len(), 3);
    assert_eq!(restored.snapshot(), snapshot);
    assert_eq!(restored.order().len(), 2);
    assert!(restored.excluded_nodes().is_empty());
    restored.iterate().unwrap();
}

#[test]
fn snapshot_with_dangling_edge_is_rejected() {
    let json = r#"{
        "operations": [{ "id": 0, "desc": { "name": "pass", "shader": { "vertex": "", "fragment": "pass" } } }],
        "edges": [{ "source": 7, "dest": 0, "kind": "normal", "weight": 1.0 }]
    }"#;
    let snapshot = GraphSnapshot::from_json(json).unwrap();
    let mut engine = engine(2, 2);
    assert!(matches!(
        engine.load_snapshot(&snapshot),
        Err(FeedError::Snapshot(_))
    ));
}

#[test]
fn clear_releases_every_node_texture() {
    let mut engine = engine(2, 2);
    let baseline = engine.backend().live_textures();
    let seed = engine.add_seed(SeedKind::ColorNoise, false);
    let a = engine.add_operation(op(PASS));
    engine.connect(seed, a, 1.0);
    assert!(engine.backend().live_textures() > baseline);

    engine.clear();

    assert!(engine.graph().is_empty());
    assert_eq!(engine.backend().live_textures(), baseline);
    assert_eq!(engine.iteration_number(), 0);
}
