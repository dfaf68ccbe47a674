//! Benchmarks for adapter merging

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kdtune_core::lora::{get_merged_lora_ckpt, StateDict};

fn create_state_dict(num_modules: usize, dim: usize, rank: usize, dora: bool) -> StateDict {
    let device = Device::Cpu;
    let mut state_dict = StateDict::new();
    for i in 0..num_modules {
        let prefix = format!("layers.{}.attn.q_proj", i);
        state_dict.insert(
            format!("{}.weight", prefix),
            Tensor::randn(0f32, 0.02, (dim, dim), &device).unwrap(),
        );
        state_dict.insert(
            format!("{}.lora_a.weight", prefix),
            Tensor::randn(0f32, 0.02, (rank, dim), &device).unwrap(),
        );
        state_dict.insert(
            format!("{}.lora_b.weight", prefix),
            Tensor::randn(0f32, 0.02, (dim, rank), &device).unwrap(),
        );
        if dora {
            state_dict.insert(
                format!("{}.magnitude", prefix),
                Tensor::ones(dim, DType::F32, &device).unwrap(),
            );
        }
    }
    state_dict
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_lora_ckpt");

    for dim in [64, 256, 1024].iter() {
        for rank in [8, 16].iter() {
            let state_dict = create_state_dict(4, *dim, *rank, false);
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("dim_{}_rank_{}", dim, rank)),
                &state_dict,
                |b, state_dict| {
                    b.iter(|| get_merged_lora_ckpt(black_box(state_dict), *rank, 16.0).unwrap());
                },
            );
        }
    }
    group.finish();
}

fn bench_merge_dora(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_dora_ckpt");

    for dim in [64, 256, 1024].iter() {
        let state_dict = create_state_dict(4, *dim, 8, true);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("dim_{}", dim)),
            &state_dict,
            |b, state_dict| {
                b.iter(|| get_merged_lora_ckpt(black_box(state_dict), 8, 16.0).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_merge, bench_merge_dora);
criterion_main!(benches);
