use criterion::{criterion_group, criterion_main, Criterion};
use display_core::{
    display::{DisplayConfig, DisplayCore},
    format::Fourcc,
    hw::{ResourceDescriptor, StaticProbe},
    layer::{Layer, LayerBuffer, LayerStack},
    strategy::DefaultStrategy,
    sync::NativeSync,
    utils::{Physical, Rectangle, Size},
};
use rand::Rng;

fn random_stack(rand: &mut impl Rng, stage: Size<i32, Physical>, count: usize) -> LayerStack {
    let layers = (0..count)
        .map(|index| {
            let w = rand.gen_range(64..=stage.w / 2);
            let h = rand.gen_range(64..=stage.h / 2);
            let x = rand.gen_range(0..stage.w - w);
            let y = rand.gen_range(0..stage.h - h);
            // every other layer is scaled by up to 2x in either direction
            let (buffer_w, buffer_h) = if index % 2 == 0 {
                (w, h)
            } else {
                (rand.gen_range(w / 2..=w * 2), rand.gen_range(h / 2..=h * 2))
            };
            let format = if index == 0 { Fourcc::Nv12 } else { Fourcc::Argb8888 };
            Layer::new(
                LayerBuffer::new(buffer_w as u32, buffer_h as u32, format, 3),
                Rectangle::new((x, y).into(), (w, h).into()),
            )
        })
        .collect();
    LayerStack::new(layers)
}

fn criterion_benchmark(c: &mut Criterion) {
    let config = DisplayConfig::default();
    let core = DisplayCore::new(&StaticProbe(ResourceDescriptor::default())).unwrap();
    let display = core
        .create_display(config.clone(), Box::new(DefaultStrategy::new()))
        .unwrap();

    let mut rand = rand::thread_rng();
    let stacks = (0..64)
        .map(|_| random_stack(&mut rand, config.size, 8))
        .collect::<Vec<_>>();

    c.bench_function("prepare and commit", |b| {
        let mut stacks = stacks.iter().cycle();
        b.iter(|| {
            let stack = stacks.next().unwrap();
            display.prepare(stack).unwrap();
            display.commit(&NativeSync).unwrap()
        });
    });

    c.bench_function("prepare gpu fallback", |b| {
        let stack = LayerStack::new(
            (0..8)
                .map(|_| {
                    Layer::new(
                        LayerBuffer::new(3840, 2160, Fourcc::Nv12, 3),
                        Rectangle::from_size((120, 68).into()),
                    )
                })
                .collect(),
        );
        b.iter(|| {
            let frame = display.prepare(&stack).unwrap();
            display.discard_pending();
            frame
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
