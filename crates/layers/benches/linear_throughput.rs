use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, QuantNoise},
};

fn bench_linear(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 4usize;
    let seq = 128usize;
    let widths = &[256usize, 512, 1024];
    let dtypes = &[DType::F32, DType::BF16];

    for &dtype in dtypes {
        let mut group = c.benchmark_group(format!("projection/{dtype:?}"));
        for &width in widths {
            let linear = Linear::with_init(
                LinearConfig::new(width, width),
                &LinearInit::fan_in_uniform(),
                &device,
                dtype,
            )
            .expect("linear init");
            let noisy = linear
                .clone()
                .with_quant_noise(QuantNoise::new(0.1, 8, width).expect("q-noise"));
            let input = Tensor::randn(0f32, 1.0, (batch, seq, width), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let elements = (batch * seq * width * width) as u64;
            group.throughput(Throughput::Elements(elements));
            group.bench_with_input(
                BenchmarkId::new("eval", width),
                &(linear, input.clone()),
                |b, (linear, input)| {
                    b.iter(|| {
                        let out = linear
                            .forward_t(black_box(input), &policy, false)
                            .expect("forward");
                        black_box(out);
                    });
                },
            );
            group.bench_with_input(
                BenchmarkId::new("train_qnoise", width),
                &(noisy, input),
                |b, (linear, input)| {
                    b.iter(|| {
                        let out = linear
                            .forward_t(black_box(input), &policy, true)
                            .expect("forward");
                        black_box(out);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_linear);
criterion_main!(benches);
