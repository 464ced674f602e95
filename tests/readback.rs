use feedloop::{
    EdgeKind, Engine, OperationDesc, Readback, RenderingConfig, ShaderSource, SoftwareBackend,
    TextureManager,
};

const STEP: &str = "step";

/// a ─▶ b, with b fed back into a: the output grows by 4/255 every tick, so a
/// read-back pixel tells which frame it came from.
fn counting_engine(latency: u64, buffers: usize) -> Engine<SoftwareBackend> {
    let mut backend = SoftwareBackend::new().with_fence_latency(latency);
    backend.register_kernel(STEP, |ctx, x, y| {
        let [r, ..] = ctx.input(x, y);
        let v = r + 4.0 / 255.0;
        [v, v, v, 1.0]
    });
    backend.register_kernel("pass", |ctx, x, y| ctx.input(x, y));

    let config = RenderingConfig::new().size(2, 2).readback_buffers(buffers);
    let mut engine = Engine::new(backend, config).unwrap();
    let a = engine.add_operation(OperationDesc::new(STEP, ShaderSource::fragment_only(STEP)));
    let b = engine.add_operation(OperationDesc::new("pass", ShaderSource::fragment_only("pass")));
    engine.connect(a, b, 1.0);
    engine.connect(b, a, 1.0);
    engine.set_edge_type(b, a, EdgeKind::Blit);
    engine.set_output(Some(b));
    engine
}

#[test]
fn frames_lag_by_at_most_the_ring_depth() {
    let buffers = 3;
    let mut engine = counting_engine(3, buffers);
    let mut last_frame = 0;

    for tick in 1..=20u32 {
        engine.iterate().unwrap();
        let img = engine.output_image().unwrap();
        let frame = img.get_pixel(0, 0).0[0] as u32 / 4;

        assert!(frame >= 1, "tick {tick} returned an empty frame");
        assert!(frame <= tick);
        assert!(tick - frame < buffers as u32, "tick {tick} returned frame {frame}");
        assert!(frame >= last_frame, "frames went backwards at tick {tick}");
        last_frame = frame;
    }

    assert_eq!(engine.backend().stats().torn_reads, 0);
}

#[test]
fn fast_device_returns_the_current_frame_without_blocking_after_warmup() {
    let mut engine = counting_engine(0, 3);

    for tick in 1..=5u32 {
        engine.iterate().unwrap();
        let img = engine.output_image().unwrap();
        assert_eq!(img.get_pixel(1, 1).0[0] as u32, tick * 4);
    }

    let stats = engine.backend().stats();
    assert_eq!(stats.torn_reads, 0);
    assert_eq!(stats.blocking_waits, 0);
}

#[test]
fn ring_never_holds_more_than_n_minus_one_copies() {
    let mut gpu = SoftwareBackend::new().with_fence_latency(10);
    let mut textures = TextureManager::new(RenderingConfig::new().size(2, 2));
    let out = textures.create_texture(&mut gpu, "out");
    let mut readback = Readback::new(4);

    for _ in 0..12 {
        readback.read(&mut gpu, &mut textures, Some(out)).unwrap();
        assert!(readback.in_flight() < readback.buffer_count());
    }
    assert_eq!(gpu.stats().torn_reads, 0);
    assert_eq!(gpu.stats().copies, 12);
}

#[test]
fn resize_restarts_the_ring_at_the_new_size() {
    let mut engine = counting_engine(2, 3);
    for _ in 0..4 {
        engine.iterate().unwrap();
        engine.output_image().unwrap();
    }

    engine.resize(3, 5).unwrap();
    engine.iterate().unwrap();
    let img = engine.output_image().unwrap();

    assert_eq!(img.dimensions(), (3, 5));
    assert_eq!(engine.backend().stats().torn_reads, 0);
}
