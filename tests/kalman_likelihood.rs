mod common;

use approx::assert_relative_eq;
use dsgers::gensys::Transition;
use dsgers::kalman::{self, gaussian_log_density};
use dsgers::smoother::{koopman_smooth, rts_smooth, simulation_smooth};
use dsgers::{
    FilterOptions, InitialState, Measurement, ObservedData, RegimeSchedule, SolverOptions, System,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use common::{ar1_covariance, ar1_params, simulate_ar1, Ar1};

fn ar1_schedule(model: &Ar1, rho: f64, sigma: f64) -> RegimeSchedule {
    RegimeSchedule::assemble(
        model,
        &ar1_params(rho, sigma),
        &SolverOptions::default(),
        None,
    )
    .unwrap()
}

/// One state `x_t = 0.8 x_{t-1} + ε_t` seen through two noisy signals.
fn two_signal_system(observables: usize) -> System {
    let transition = Transition::new(
        DMatrix::from_element(1, 1, 0.8),
        DMatrix::identity(1, 1),
        DVector::zeros(1),
    )
    .unwrap();
    let loadings = [1.0, 2.0];
    let errors = [0.5, 0.3];
    let measurement = Measurement::new(
        DMatrix::from_fn(observables, 1, |i, _| loadings[i]),
        DVector::from_fn(observables, |i, _| 0.1 * i as f64),
        DMatrix::identity(1, 1),
    )
    .with_measurement_error(DMatrix::from_fn(observables, observables, |i, j| {
        if i == j {
            errors[i]
        } else {
            0.0
        }
    }));
    System::new(transition, measurement).unwrap()
}

#[test]
fn exact_ar1_likelihood_matches_joint_density() {
    let (rho, sigma) = (0.7, 0.5);
    let data = simulate_ar1(rho, sigma, 30, 7);
    let model = Ar1::exact();

    let output = kalman::filter(
        &ar1_schedule(&model, rho, sigma),
        &data,
        &FilterOptions::default(),
    )
    .unwrap();

    let y = data.values().column(0).into_owned();
    let expected = gaussian_log_density(&y, &ar1_covariance(rho, sigma, 30)).unwrap();
    assert_relative_eq!(output.log_likelihood, expected, epsilon = 1e-8);
    assert_relative_eq!(
        output.contributions.iter().sum::<f64>(),
        output.log_likelihood,
        epsilon = 1e-12
    );
}

#[test]
fn missing_series_equals_dropping_the_observable() {
    let first = [0.3, -0.1, 0.8, 0.4, -0.6, 0.2];
    let mut both = Vec::new();
    for &y in &first {
        both.push(y);
        both.push(f64::NAN);
    }
    let with_gap = ObservedData::from_rows(6, 2, &both).unwrap();
    let reduced = ObservedData::from_rows(6, 1, &first).unwrap();

    let options = FilterOptions::default();
    let full = kalman::filter(
        &RegimeSchedule::from(two_signal_system(2)),
        &with_gap,
        &options,
    )
    .unwrap();
    let single = kalman::filter(
        &RegimeSchedule::from(two_signal_system(1)),
        &reduced,
        &options,
    )
    .unwrap();

    assert_relative_eq!(full.log_likelihood, single.log_likelihood, epsilon = 1e-12);
    for (a, b) in full.filtered_means.iter().zip(&single.filtered_means) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn presample_periods_are_filtered_but_not_counted() {
    let data = simulate_ar1(0.5, 1.0, 20, 3);
    let schedule = ar1_schedule(&Ar1::exact(), 0.5, 1.0);

    let full = kalman::filter(&schedule, &data, &FilterOptions::default()).unwrap();
    let trimmed = kalman::filter(
        &schedule,
        &data,
        &FilterOptions::default().with_presample(4),
    )
    .unwrap();

    let dropped: f64 = full.contributions[..4].iter().sum();
    assert_relative_eq!(
        trimmed.log_likelihood,
        full.log_likelihood - dropped,
        epsilon = 1e-10
    );
    assert_eq!(trimmed.filtered_means, full.filtered_means);
}

#[test]
fn identical_regimes_reproduce_the_single_regime_filter() {
    let data = simulate_ar1(0.6, 0.8, 15, 11);
    let system = ar1_schedule(&Ar1::exact(), 0.6, 0.8).initial().clone();
    let single = RegimeSchedule::from(system.clone());
    let switching = RegimeSchedule::switching(system.clone(), system, 6).unwrap();

    let options = FilterOptions::default();
    let a = kalman::filter(&single, &data, &options).unwrap();
    let b = kalman::filter(&switching, &data, &options).unwrap();
    assert_relative_eq!(a.log_likelihood, b.log_likelihood, epsilon = 1e-12);
}

#[test]
fn regime_switch_chains_two_single_regime_filters() {
    let boundary = 6;
    let data = simulate_ar1(0.6, 0.8, 15, 11);
    let values: Vec<f64> = data.values().column(0).iter().copied().collect();
    let before = ar1_schedule(&Ar1::exact(), 0.6, 0.8).initial().clone();
    let mut after = before.clone();
    after.measurement.zz *= 2.0;
    after.measurement.ee = DMatrix::from_element(1, 1, 0.3);

    let options = FilterOptions::default();
    let switching = RegimeSchedule::switching(before.clone(), after.clone(), boundary).unwrap();
    let switched = kalman::filter(&switching, &data, &options).unwrap();

    let head_data = ObservedData::from_rows(boundary, 1, &values[..boundary]).unwrap();
    let head =
        kalman::filter(&RegimeSchedule::from(before.clone()), &head_data, &options).unwrap();
    let carried = options.clone().with_initial_state(InitialState::Given {
        mean: head.filtered_means[boundary - 1].iter().copied().collect(),
        covariance: head.filtered_covariances[boundary - 1].iter().copied().collect(),
    });
    let tail_data = ObservedData::from_rows(15 - boundary, 1, &values[boundary..]).unwrap();
    let tail = kalman::filter(&RegimeSchedule::from(after), &tail_data, &carried).unwrap();

    assert_relative_eq!(
        switched.log_likelihood,
        head.log_likelihood + tail.log_likelihood,
        epsilon = 1e-10
    );
    for (t, expected) in head.contributions.iter().chain(&tail.contributions).enumerate() {
        assert_relative_eq!(switched.contributions[t], *expected, epsilon = 1e-10);
    }
    assert_relative_eq!(
        switched.filtered_means[14],
        tail.filtered_means[14 - boundary],
        epsilon = 1e-10
    );

    let unswitched = kalman::filter(&RegimeSchedule::from(before), &data, &options).unwrap();
    assert!((switched.log_likelihood - unswitched.log_likelihood).abs() > 1e-3);
}

#[test]
fn smoothers_agree_with_measurement_error() {
    let model = Ar1 {
        measurement_error: 0.4,
    };
    let schedule = ar1_schedule(&model, 0.9, 1.0);
    let mut values: Vec<f64> = simulate_ar1(0.9, 1.0, 25, 5)
        .values()
        .column(0)
        .iter()
        .copied()
        .collect();
    values[10] = f64::NAN;
    let data = ObservedData::from_rows(25, 1, &values).unwrap();

    let output = kalman::filter(&schedule, &data, &FilterOptions::default()).unwrap();
    let rts = rts_smooth(&schedule, &output).unwrap();
    let koopman = koopman_smooth(&schedule, &data, &output).unwrap();

    for t in 0..25 {
        assert_relative_eq!(rts.means[t], koopman.means[t], epsilon = 1e-8);
        assert_relative_eq!(rts.covariances[t], koopman.covariances[t], epsilon = 1e-8);
    }
}

#[test]
fn simulation_smoother_draws_center_on_the_smoothed_path() {
    let model = Ar1 {
        measurement_error: 0.5,
    };
    let schedule = ar1_schedule(&model, 0.9, 1.0);
    let data = simulate_ar1(0.9, 1.0, 12, 21);
    let options = FilterOptions::default();

    let output = kalman::filter(&schedule, &data, &options).unwrap();
    let smoothed = koopman_smooth(&schedule, &data, &output).unwrap();
    let smoothed_shocks = smoothed.shocks.clone().unwrap();

    let draws = 2_000;
    let mut rng = SmallRng::seed_from_u64(99);
    let mut state_sum = vec![DVector::<f64>::zeros(1); 12];
    let mut shock_sum = vec![DVector::<f64>::zeros(1); 12];
    for _ in 0..draws {
        let path = simulation_smooth(&schedule, &data, &smoothed, &options, &mut rng).unwrap();
        assert_eq!(path.states.len(), 12);
        for t in 0..12 {
            state_sum[t] += &path.states[t];
            shock_sum[t] += &path.shocks[t];
        }
    }

    for t in 0..12 {
        let state_mean = &state_sum[t] / draws as f64;
        let shock_mean = &shock_sum[t] / draws as f64;
        assert!(
            (state_mean[0] - smoothed.means[t][0]).abs() < 0.08,
            "period {t}: draw mean {} vs smoothed {}",
            state_mean[0],
            smoothed.means[t][0]
        );
        assert!((shock_mean[0] - smoothed_shocks[t][0]).abs() < 0.1);
    }
}

#[test]
fn noiseless_observation_smooths_to_the_true_states() {
    let data = simulate_ar1(0.8, 1.0, 20, 13);
    let schedule = ar1_schedule(&Ar1::exact(), 0.8, 1.0);
    let output = kalman::filter(&schedule, &data, &FilterOptions::default()).unwrap();
    let rts = rts_smooth(&schedule, &output).unwrap();
    let koopman = koopman_smooth(&schedule, &data, &output).unwrap();

    for t in 0..20 {
        let truth = data.values()[(t, 0)];
        assert_relative_eq!(rts.means[t][0], truth, epsilon = 1e-8);
        assert_relative_eq!(koopman.means[t][0], truth, epsilon = 1e-8);
        assert!(koopman.covariances[t][(0, 0)].abs() < 1e-8);
    }
}
