use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gtwnet::graph::row_normalize;
use gtwnet::wls::{WlsConfig, solve_local_wls};
use ndarray::{Array1, Array2};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

struct Problem {
    x: Array2<f64>,
    y: Array1<f64>,
    w: Array2<f64>,
}

fn random_problem(n: usize, p: usize) -> Problem {
    let mut rng = StdRng::seed_from_u64(0x6715 + n as u64);
    let x = Array2::from_shape_fn((n, p), |_| rng.sample(Standard));
    let noise = Normal::new(0.0, 0.1).unwrap();
    let y = Array1::from_shape_fn(n, |i| x.row(i).sum() + rng.sample(noise));
    let raw = Array2::from_shape_fn((n, n), |_| rng.gen_range(0.0..1.0));
    let w = row_normalize(raw.view());
    Problem { x, y, w }
}

fn benchmark_local_wls(c: &mut Criterion) {
    let sizes = [64_usize, 128, 256];
    let problems: Vec<_> = sizes.iter().map(|&n| (n, random_problem(n, 6))).collect();
    let ridge = WlsConfig::ridge(5.0);
    let huber = WlsConfig::huber(5.0, 1.0, 3);

    let mut group = c.benchmark_group("local_wls");
    for (n, problem) in problems.iter() {
        group.throughput(Throughput::Elements(*n as u64));

        group.bench_with_input(BenchmarkId::new("ridge", n), problem, |b, input| {
            b.iter(|| {
                let fit = solve_local_wls(
                    black_box(input.x.view()),
                    input.y.view(),
                    input.w.view(),
                    &ridge,
                );
                black_box(fit).ok();
            });
        });

        group.bench_with_input(BenchmarkId::new("huber", n), problem, |b, input| {
            b.iter(|| {
                let fit = solve_local_wls(
                    black_box(input.x.view()),
                    input.y.view(),
                    input.w.view(),
                    &huber,
                );
                black_box(fit).ok();
            });
        });
    }
    group.finish();
}

criterion_group!(local_wls, benchmark_local_wls);
criterion_main!(local_wls);
