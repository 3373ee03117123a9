//! Fixed-interval smoothers run on top of a completed filter pass.
//!
//! - [`rts_smooth`]: Rauch–Tung–Striebel (Hamilton) backward recursion on the
//!   filtered moments.
//! - [`koopman_smooth`]: Koopman's state and disturbance smoother, which also
//!   returns the smoothed structural shocks and never inverts a state covariance.
//! - [`simulation_smooth`]: Durbin–Koopman simulation smoother drawing state and
//!   shock paths from their distribution given the data.

use log::trace;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::data::ObservedData;
use crate::error::{DsgeError, Result};
use crate::kalman::{self, KalmanOutput};
use crate::linalg::{psd_factor, symmetrize};
use crate::options::FilterOptions;
use crate::system::RegimeSchedule;

/// Smoothed state moments `s_{t|T}`, `P_{t|T}`.
#[derive(Clone, Debug)]
pub struct Smoothed {
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
    /// Smoothed structural shocks `E[ε_t | y_{1:T}]`, when the smoother produces them.
    pub shocks: Option<Vec<DVector<f64>>>,
}

/// One draw of the states and shocks given the data.
#[derive(Clone, Debug)]
pub struct SimulatedPath {
    pub states: Vec<DVector<f64>>,
    pub shocks: Vec<DVector<f64>>,
}

/// Rauch–Tung–Striebel smoother.
///
/// Uses the pseudo-inverse of the predicted covariance so that states with a
/// degenerate predictive distribution (identities, lags) are handled.
pub fn rts_smooth(schedule: &RegimeSchedule, output: &KalmanOutput) -> Result<Smoothed> {
    let periods = output.period_count();
    if periods == 0 {
        return Ok(Smoothed {
            means: Vec::new(),
            covariances: Vec::new(),
            shocks: None,
        });
    }

    let mut means = output.filtered_means.clone();
    let mut covariances = output.filtered_covariances.clone();
    for t in (0..periods - 1).rev() {
        let ttt = &schedule.system_at(t + 1).transition.ttt;
        let p_pred_inv = output.predicted_covariances[t + 1]
            .clone()
            .pseudo_inverse(1e-12)
            .map_err(|_| DsgeError::singular("RTS predicted covariance"))?;
        let gain = &output.filtered_covariances[t] * ttt.transpose() * p_pred_inv;

        let mean_gap = &means[t + 1] - &output.predicted_means[t + 1];
        means[t] = &output.filtered_means[t] + &gain * mean_gap;

        let cov_gap = &covariances[t + 1] - &output.predicted_covariances[t + 1];
        covariances[t] = symmetrize(
            &(&output.filtered_covariances[t] + &gain * cov_gap * gain.transpose()),
        );
    }

    Ok(Smoothed {
        means,
        covariances,
        shocks: None,
    })
}

/// Koopman state and disturbance smoother.
pub fn koopman_smooth(
    schedule: &RegimeSchedule,
    data: &ObservedData,
    output: &KalmanOutput,
) -> Result<Smoothed> {
    let periods = output.period_count();
    let n = schedule.initial().state_count();

    let mut means = vec![DVector::zeros(n); periods];
    let mut covariances = vec![DMatrix::zeros(n, n); periods];
    let mut shocks = Vec::with_capacity(periods);

    // r_t and N_t of the backward recursion, starting from zero after the sample.
    let mut r = DVector::<f64>::zeros(n);
    let mut big_n = DMatrix::<f64>::zeros(n, n);

    for t in (0..periods).rev() {
        let system = schedule.system_at(t);
        let next = &schedule.system_at(t + 1).transition.ttt;
        let a = &output.predicted_means[t];
        let p = &output.predicted_covariances[t];

        let observed = data.observed_in(t);
        if observed.is_empty() {
            r = next.transpose() * &r;
            big_n = next.transpose() * &big_n * next;
        } else {
            let step =
                kalman::update(system, data, t, &observed, a, p, output.singular_tolerance)?;
            let f_inv_v = step.factor.solve(&step.innovation);
            let f_inv_z = step.factor.solve(&step.zz);
            // K_t = T P Zᵀ F⁻¹, L_t = T - K_t Z
            let gain = next * p * f_inv_z.transpose();
            let l = next - &gain * &step.zz;
            r = step.zz.transpose() * f_inv_v + l.transpose() * &r;
            big_n = step.zz.transpose() * &f_inv_z + l.transpose() * &big_n * &l;
        }
        big_n = symmetrize(&big_n);

        means[t] = a + p * &r;
        covariances[t] = symmetrize(&(p - p * &big_n * p));

        let rrr = &system.transition.rrr;
        shocks.push(&system.measurement.qq * rrr.transpose() * &r);
    }
    shocks.reverse();

    Ok(Smoothed {
        means,
        covariances,
        shocks: Some(shocks),
    })
}

/// Durbin–Koopman simulation smoother.
///
/// Simulates an artificial sample `(s⁺, y⁺)` from the system with the missingness
/// pattern of `data`, smooths it, and returns `s⁺ - ŝ⁺ + ŝ`, where `ŝ` is the
/// smoothed path of `data` supplied in `smoothed`.
pub fn simulation_smooth<R: Rng + ?Sized>(
    schedule: &RegimeSchedule,
    data: &ObservedData,
    smoothed: &Smoothed,
    options: &FilterOptions,
    rng: &mut R,
) -> Result<SimulatedPath> {
    let periods = data.period_count();
    let smoothed_shocks = smoothed
        .shocks
        .as_ref()
        .ok_or_else(|| DsgeError::invalid_option("smoothed", "shocks are required"))?;
    if smoothed.means.len() != periods {
        return Err(DsgeError::dimension_mismatch(
            "smoothed periods",
            periods,
            smoothed.means.len(),
        ));
    }

    let first = schedule.initial();
    let (initial_mean, initial_covariance) = kalman::initial_state(first, options)?;
    let mut state =
        initial_mean + psd_factor(&initial_covariance) * standard_normal(rng, first.state_count());

    let mut states = Vec::with_capacity(periods);
    let mut shocks = Vec::with_capacity(periods);
    let mut artificial = DMatrix::from_element(periods, data.series_count(), f64::NAN);
    for t in 0..periods {
        let system = schedule.system_at(t);
        let transition = &system.transition;
        let measurement = &system.measurement;
        let shock = psd_factor(&measurement.qq) * standard_normal(rng, system.shock_count());
        state = &transition.ccc + &transition.ttt * &state + &transition.rrr * &shock;

        let noise = psd_factor(&measurement.ee) * standard_normal(rng, system.observable_count());
        let y = &measurement.zz * &state + &measurement.dd + noise;
        for j in data.observed_in(t) {
            artificial[(t, j)] = y[j];
        }
        states.push(state.clone());
        shocks.push(shock);
    }

    let artificial = ObservedData::new(artificial)?;
    let artificial_output = kalman::filter(schedule, &artificial, options)?;
    let artificial_smoothed = koopman_smooth(schedule, &artificial, &artificial_output)?;
    let artificial_shocks = artificial_smoothed
        .shocks
        .as_ref()
        .ok_or_else(|| DsgeError::NumericalError {
            context: "simulation smoother",
        })?;

    for t in 0..periods {
        states[t] += &smoothed.means[t] - &artificial_smoothed.means[t];
        shocks[t] += &smoothed_shocks[t] - &artificial_shocks[t];
    }
    trace!("simulation smoother drew a path of {periods} periods");

    Ok(SimulatedPath { states, shocks })
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R, len: usize) -> DVector<f64> {
    DVector::from_iterator(len, (0..len).map(|_| StandardNormal.sample(&mut *rng)))
}
