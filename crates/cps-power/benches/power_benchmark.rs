use cps_core::{Family, Method, RandomEffectDist, TrialDesign};
use cps_power::{FitWorker, Generator, ModelPlan, ReferenceBackend};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn design(family: Family, clusters: usize) -> TrialDesign {
    let (outcome_param, sigma_sq) = match family {
        Family::Normal => (vec![0.0, 0.3, 0.6], Some(vec![1.0; 3])),
        Family::Binary => (vec![0.2, 0.3, 0.4], None),
        _ => (vec![30.0, 35.0, 70.0], None),
    };
    TrialDesign {
        narms: 3,
        nclusters: vec![clusters; 3],
        nsubjects: vec![vec![20; clusters]; 3],
        outcome_param,
        sigma_b_sq: vec![0.2; 3],
        sigma_sq,
        negbin_size: None,
        family,
        random_effect: RandomEffectDist::Normal,
        alpha: 0.05,
    }
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("power/generate");
    for clusters in [10usize, 100] {
        for family in [Family::Normal, Family::Binary, Family::Poisson] {
            let d = design(family, clusters);
            let generator = Generator::new(&d).unwrap();
            group.bench_with_input(
                BenchmarkId::new(family.to_string(), clusters),
                &generator,
                |b, generator| {
                    let mut seed = 0u64;
                    b.iter(|| {
                        seed = seed.wrapping_add(1);
                        black_box(generator.generate(black_box(seed)).unwrap().len());
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_single_fit(c: &mut Criterion) {
    let backend = ReferenceBackend::new();
    let mut group = c.benchmark_group("power/fit");
    for method in [Method::Glmm, Method::Gee] {
        for family in [Family::Normal, Family::Poisson] {
            let d = design(family, 20);
            let data = Generator::new(&d).unwrap().generate(42).unwrap();
            let worker = FitWorker::new(&backend, ModelPlan::new(family, method), d.narms);
            group.bench_with_input(
                BenchmarkId::new(format!("{method}"), family.to_string()),
                &data,
                |b, data| {
                    b.iter(|| black_box(worker.fit(0, black_box(data)).converged));
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_generate, bench_single_fit);
criterion_main!(benches);
