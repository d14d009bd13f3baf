use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rendergraph::nodes::{ConstantSourceNode, GainNode, OscillatorNode, PannerNode};
use rendergraph::positional::Vec3;
use rendergraph::{AudioContext, BaseAudioContext, ContextOptions};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("OscillatorNode render_quantum", |b| {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut osc = OscillatorNode::new(&ctx).unwrap();
        ctx.connect(&osc, &ctx.destination()).unwrap();
        osc.start(0.0).unwrap();
        ctx.resume().unwrap();

        b.iter(|| black_box(renderer.render_quantum().peak()))
    });

    c.bench_function("gain chain x32 render_quantum", |b| {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        let gains: Vec<GainNode> = (0..32).map(|_| GainNode::new(&ctx).unwrap()).collect();
        ctx.connect(&source, &gains[0]).unwrap();
        for pair in gains.windows(2) {
            ctx.connect(&pair[0], &pair[1]).unwrap();
        }
        ctx.connect(&gains[31], &ctx.destination()).unwrap();
        source.start(0.0).unwrap();
        ctx.resume().unwrap();

        b.iter(|| black_box(renderer.render_quantum().peak()))
    });

    c.bench_function("PannerNode moving listener", |b| {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        let panner = PannerNode::new(&ctx).unwrap();
        panner.set_position(Vec3::new(1.0, 0.0, -2.0)).unwrap();
        ctx.connect(&source, &panner).unwrap();
        ctx.connect(&panner, &ctx.destination()).unwrap();
        source.start(0.0).unwrap();
        ctx.resume().unwrap();
        let listener = ctx.listener();
        let mut x = 0.0f32;

        b.iter(|| {
            x = (x + 0.01) % 4.0;
            listener.set_position(Vec3::new(x, 0.0, 0.0)).unwrap();
            black_box(renderer.render_quantum().peak())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
