use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dsgers::gensys::{self, EquilibriumSystem};
use dsgers::kalman;
use dsgers::{FilterOptions, Measurement, ObservedData, RegimeSchedule, SolverOptions, System};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// `x_t = a E_t x_{t+1} + z_t` with an AR(1) driver, states `(x_t, z_t, E_t x_{t+1})`.
fn forward_looking(a: f64, rho: f64) -> EquilibriumSystem {
    let gamma0 = DMatrix::from_row_slice(3, 3, &[1.0, -1.0, -a, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
    let mut gamma1 = DMatrix::zeros(3, 3);
    gamma1[(1, 1)] = rho;
    gamma1[(2, 2)] = 1.0;
    EquilibriumSystem::new(
        gamma0,
        gamma1,
        DMatrix::from_column_slice(3, 1, &[0.0, 1.0, 0.0]),
        DMatrix::from_column_slice(3, 1, &[0.0, 0.0, 1.0]),
    )
    .unwrap()
}

fn schedule() -> RegimeSchedule {
    let transition = gensys::solve(&forward_looking(0.5, 0.9), &SolverOptions::default()).unwrap();
    let measurement = Measurement::new(
        DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        DVector::zeros(2),
        DMatrix::identity(1, 1),
    )
    .with_measurement_error(DMatrix::from_diagonal_element(2, 2, 0.1));
    System::new(transition, measurement).unwrap().into()
}

fn data(periods: usize) -> ObservedData {
    let mut rng = SmallRng::seed_from_u64(42);
    let values: Vec<f64> = (0..2 * periods)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    ObservedData::from_rows(periods, 2, &values).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let system = forward_looking(0.5, 0.9);
    let options = SolverOptions::default();
    c.bench_function("gensys 3 states", |b| {
        b.iter(|| gensys::solve(black_box(&system), &options).unwrap())
    });

    let schedule = schedule();
    let filter_options = FilterOptions::default();
    for periods in [50, 200] {
        let data = data(periods);
        c.bench_function(&format!("kalman filter {periods} periods"), |b| {
            b.iter(|| kalman::filter(black_box(&schedule), black_box(&data), &filter_options).unwrap())
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
