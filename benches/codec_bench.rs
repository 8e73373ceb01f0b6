//! Benchmarks for the delta blob codec and the aggregation fold.
//!
//! Run with `cargo bench --bench codec_bench`.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use edgeorchestra::aggregator::{aggregate, SubmissionInput};
use edgeorchestra::weights::{Layer, LayerTable};
use std::collections::HashMap;
use uuid::Uuid;

/// A model shaped like a small mobile CNN: ~420k parameters.
fn mobile_cnn() -> LayerTable {
    LayerTable::new(vec![
        Layer {
            name: "conv1.weight".into(),
            values: (0..3 * 3 * 3 * 32).map(|i| (i as f32 * 0.001).sin()).collect(),
        },
        Layer {
            name: "conv2.weight".into(),
            values: (0..3 * 3 * 32 * 64).map(|i| (i as f32 * 0.002).cos()).collect(),
        },
        Layer {
            name: "fc1.weight".into(),
            values: (0..64 * 6272).map(|i| (i as f32 * 0.0005).sin()).collect(),
        },
        Layer {
            name: "fc1.bias".into(),
            values: vec![0.01; 64],
        },
        Layer {
            name: "fc2.weight".into(),
            values: (0..64 * 10).map(|i| i as f32 * 0.001).collect(),
        },
    ])
}

fn bench_encode(c: &mut Criterion) {
    let table = mobile_cnn();
    c.bench_function("encode_f16_lz4", |b| {
        b.iter(|| black_box(&table).encode_f16_lz4())
    });
    c.bench_function("encode_f32", |b| b.iter(|| black_box(&table).encode_f32()));
}

fn bench_decode(c: &mut Criterion) {
    let blob = mobile_cnn().encode_f16_lz4();
    c.bench_function("decode_f16_lz4", |b| {
        b.iter(|| LayerTable::decode(black_box(&blob)).unwrap())
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let global = mobile_cnn();
    let blob = global.encode_f16_lz4();
    let submissions: Vec<SubmissionInput> = (0..8)
        .map(|i| SubmissionInput {
            device_id: Uuid::from_u128(i),
            blob: blob.clone(),
            num_samples: 100 + i as u64,
            metrics: HashMap::new(),
        })
        .collect();
    c.bench_function("aggregate_8_submissions", |b| {
        b.iter(|| aggregate(black_box(&global), submissions.clone()).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_aggregate);
criterion_main!(benches);
