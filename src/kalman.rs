//! Kalman filter for linear Gaussian state-space systems with missing observations.
//!
//! Period `t` first predicts the state from period `t - 1` using the transition in
//! force at `t`, then updates on whichever series are observed at `t`. A period
//! with no observed series is a pure prediction step and contributes nothing to
//! the likelihood.

use log::{debug, trace};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::data::ObservedData;
use crate::error::{DsgeError, Result};
use crate::linalg::{discrete_lyapunov, symmetrize};
use crate::options::{FilterOptions, InitialState};
use crate::system::{Regime, RegimeSchedule, System};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Filtered moments and likelihood of a sample.
#[derive(Clone, Debug)]
pub struct KalmanOutput {
    /// Sum of the per-period contributions after the presample.
    pub log_likelihood: f64,
    /// Log density of each period's observations given the past (zero in the presample).
    pub contributions: Vec<f64>,
    /// `s_{t|t-1}`.
    pub predicted_means: Vec<DVector<f64>>,
    /// `P_{t|t-1}`.
    pub predicted_covariances: Vec<DMatrix<f64>>,
    /// `s_{t|t}`.
    pub filtered_means: Vec<DVector<f64>>,
    /// `P_{t|t}`.
    pub filtered_covariances: Vec<DMatrix<f64>>,
    /// Mean of the state before the first period.
    pub initial_mean: DVector<f64>,
    /// Covariance of the state before the first period.
    pub initial_covariance: DMatrix<f64>,
    /// Relative pivot tolerance the filter ran with, reused by the smoothers.
    pub singular_tolerance: f64,
}

impl KalmanOutput {
    /// Number of filtered periods.
    pub fn period_count(&self) -> usize {
        self.contributions.len()
    }
}

/// Runs the filter over `data`.
///
/// Returns [`DsgeError::SingularInnovation`] when the covariance of the observed
/// innovations is not positive definite in some period.
pub fn filter(
    schedule: &RegimeSchedule,
    data: &ObservedData,
    options: &FilterOptions,
) -> Result<KalmanOutput> {
    let first = schedule.initial();
    check_observables(schedule, data)?;

    let (initial_mean, initial_covariance) = initial_state(first, options)?;
    let periods = data.period_count();

    let mut output = KalmanOutput {
        log_likelihood: 0.0,
        contributions: Vec::with_capacity(periods),
        predicted_means: Vec::with_capacity(periods),
        predicted_covariances: Vec::with_capacity(periods),
        filtered_means: Vec::with_capacity(periods),
        filtered_covariances: Vec::with_capacity(periods),
        initial_mean: initial_mean.clone(),
        initial_covariance: initial_covariance.clone(),
        singular_tolerance: options.singular_tolerance,
    };

    let mut s = initial_mean;
    let mut p = initial_covariance;
    let pre_cov = first.state_innovation_covariance();
    let post_cov = match schedule {
        RegimeSchedule::Switching { after, .. } => after.state_innovation_covariance(),
        RegimeSchedule::Single(_) => pre_cov.clone(),
    };

    for t in 0..periods {
        let system = schedule.system_at(t);
        let innovation_cov = match schedule.regime_at(t) {
            Regime::PreBoundary => &pre_cov,
            Regime::PostBoundary => &post_cov,
        };
        let transition = &system.transition;

        let s_pred = &transition.ccc + &transition.ttt * &s;
        let p_pred =
            symmetrize(&(&transition.ttt * &p * transition.ttt.transpose() + innovation_cov));

        let observed = data.observed_in(t);
        let (s_filt, p_filt, contribution) = if observed.is_empty() {
            (s_pred.clone(), p_pred.clone(), 0.0)
        } else {
            let step = update(
                system,
                data,
                t,
                &observed,
                &s_pred,
                &p_pred,
                options.singular_tolerance,
            )?;
            (step.mean, step.covariance, step.log_density)
        };

        if contribution.is_nan() {
            return Err(DsgeError::NumericalError {
                context: "Kalman likelihood",
            });
        }
        let counted = if t < options.presample { 0.0 } else { contribution };
        output.log_likelihood += counted;
        output.contributions.push(counted);

        output.predicted_means.push(s_pred);
        output.predicted_covariances.push(p_pred);
        output.filtered_means.push(s_filt.clone());
        output.filtered_covariances.push(p_filt.clone());
        s = s_filt;
        p = p_filt;
    }

    trace!(
        "Kalman filter: {periods} periods, log likelihood {:.6}",
        output.log_likelihood
    );
    Ok(output)
}

/// Mean and covariance of the state before the first period.
pub fn initial_state(
    system: &System,
    options: &FilterOptions,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let n = system.state_count();
    let transition = &system.transition;
    match &options.initial_state {
        InitialState::Given { mean, covariance } => {
            if mean.len() != n {
                return Err(DsgeError::dimension_mismatch("initial mean", n, mean.len()));
            }
            if covariance.len() != n * n {
                return Err(DsgeError::dimension_mismatch(
                    "initial covariance entries",
                    n * n,
                    covariance.len(),
                ));
            }
            Ok((
                DVector::from_column_slice(mean),
                DMatrix::from_row_slice(n, n, covariance),
            ))
        }
        InitialState::Diffuse => Ok(diffuse(system, options)),
        InitialState::Stationary => {
            let covariance = discrete_lyapunov(
                &transition.ttt,
                &system.state_innovation_covariance(),
                options.lyapunov_tolerance,
                options.lyapunov_max_iterations,
            );
            let mean = (DMatrix::<f64>::identity(n, n) - &transition.ttt)
                .lu()
                .solve(&transition.ccc);
            match (mean, covariance) {
                (Some(mean), Some(covariance)) => Ok((mean, covariance)),
                _ => {
                    debug!("transition is not stationary; using a diffuse initial state");
                    Ok(diffuse(system, options))
                }
            }
        }
    }
}

fn diffuse(system: &System, options: &FilterOptions) -> (DVector<f64>, DMatrix<f64>) {
    let n = system.state_count();
    (
        system.transition.ccc.clone(),
        DMatrix::identity(n, n) * options.diffuse_scale,
    )
}

fn check_observables(schedule: &RegimeSchedule, data: &ObservedData) -> Result<()> {
    let k = schedule.initial().observable_count();
    if data.series_count() != k {
        return Err(DsgeError::dimension_mismatch(
            "observed series",
            k,
            data.series_count(),
        ));
    }
    Ok(())
}

/// Quantities of one measurement update restricted to the observed series.
pub(crate) struct UpdateStep {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub log_density: f64,
    /// Innovation `ν_t` of the observed series.
    pub innovation: DVector<f64>,
    /// Cholesky factor of the innovation covariance `F_t`.
    pub factor: Cholesky<f64, Dyn>,
    /// Measurement loadings of the observed series.
    pub zz: DMatrix<f64>,
}

/// Measurement update at period `t` for the series listed in `observed`.
///
/// `F_t` is singular when its Cholesky factorization fails or when its smallest
/// squared pivot is at or below `tolerance · max(1, max_i F_ii)`.
pub(crate) fn update(
    system: &System,
    data: &ObservedData,
    t: usize,
    observed: &[usize],
    s_pred: &DVector<f64>,
    p_pred: &DMatrix<f64>,
    tolerance: f64,
) -> Result<UpdateStep> {
    let measurement = &system.measurement;
    let zz = measurement.zz.select_rows(observed.iter());
    let dd = measurement.dd.select_rows(observed.iter());
    let ee = measurement
        .ee
        .select_rows(observed.iter())
        .select_columns(observed.iter());
    let y = data.period(t).select_rows(observed.iter());

    let innovation = y - &zz * s_pred - dd;
    let pz = p_pred * zz.transpose();
    let f = symmetrize(&(&zz * &pz + ee));
    let scale = f.diagonal().max().max(1.0);
    let factor = Cholesky::new(f).ok_or(DsgeError::SingularInnovation { period: t })?;

    let pivots = factor.l_dirty().diagonal();
    let smallest = pivots.min();
    if smallest * smallest <= tolerance * scale {
        debug!("period {t}: innovation pivot {smallest:e} below tolerance");
        return Err(DsgeError::SingularInnovation { period: t });
    }
    let log_det: f64 = 2.0 * pivots.iter().map(|d| d.ln()).sum::<f64>();
    if !log_det.is_finite() {
        return Err(DsgeError::SingularInnovation { period: t });
    }
    let scaled = factor.solve(&innovation);
    let quadratic = innovation.dot(&scaled);
    let k = observed.len() as f64;
    let log_density = -0.5 * (k * LN_2PI + log_det + quadratic);

    let mean = s_pred + &pz * scaled;
    let gain_term = factor.solve(&pz.transpose());
    let covariance = symmetrize(&(p_pred - &pz * gain_term));

    Ok(UpdateStep {
        mean,
        covariance,
        log_density,
        innovation,
        factor,
        zz,
    })
}

/// Log density of a mean-zero Gaussian vector, used by tests and diagnostics.
pub fn gaussian_log_density(x: &DVector<f64>, covariance: &DMatrix<f64>) -> Result<f64> {
    let factor = Cholesky::new(symmetrize(covariance))
        .ok_or_else(|| DsgeError::singular("Gaussian covariance"))?;
    let log_det: f64 = 2.0 * factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let quadratic = x.dot(&factor.solve(x));
    Ok(-0.5 * (x.len() as f64 * LN_2PI + log_det + quadratic))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::gensys::Transition;
    use crate::system::Measurement;

    fn scalar_system(rho: f64, sigma: f64) -> System {
        let transition = Transition::new(
            DMatrix::from_element(1, 1, rho),
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
        )
        .unwrap();
        let measurement = Measurement::new(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, sigma * sigma),
        );
        System::new(transition, measurement).unwrap()
    }

    #[test]
    fn first_period_uses_unconditional_variance() {
        let system = scalar_system(0.5, 1.0);
        let data = ObservedData::from_rows(1, 1, &[0.7]).unwrap();
        let output = filter(&system.clone().into(), &data, &FilterOptions::default()).unwrap();
        let variance = 1.0 / (1.0 - 0.25);
        let expected = -0.5 * (LN_2PI + f64::ln(variance) + 0.49 / variance);
        assert_relative_eq!(output.log_likelihood, expected, epsilon = 1e-10);
    }

    #[test]
    fn presample_periods_are_excluded() {
        let system: RegimeSchedule = scalar_system(0.5, 1.0).into();
        let data = ObservedData::from_rows(3, 1, &[0.1, -0.2, 0.4]).unwrap();
        let full = filter(&system, &data, &FilterOptions::default()).unwrap();
        let trimmed = filter(&system, &data, &FilterOptions::default().with_presample(1)).unwrap();
        assert_eq!(trimmed.contributions[0], 0.0);
        assert_relative_eq!(
            trimmed.log_likelihood,
            full.log_likelihood - full.contributions[0],
            epsilon = 1e-12
        );
    }

    #[test]
    fn unobserved_period_is_pure_prediction() {
        let system: RegimeSchedule = scalar_system(0.9, 1.0).into();
        let data = ObservedData::from_rows(2, 1, &[f64::NAN, 0.3]).unwrap();
        let output = filter(&system, &data, &FilterOptions::default()).unwrap();
        assert_eq!(output.contributions[0], 0.0);
        assert_eq!(output.filtered_means[0], output.predicted_means[0]);
        assert_eq!(output.filtered_covariances[0], output.predicted_covariances[0]);
    }

    #[test]
    fn degenerate_innovation_is_reported() {
        let system: RegimeSchedule = scalar_system(0.5, 0.0).into();
        let data = ObservedData::from_rows(1, 1, &[1.0]).unwrap();
        let result = filter(&system, &data, &FilterOptions::default());
        assert!(matches!(result, Err(DsgeError::SingularInnovation { period: 0 })));
    }

    #[test]
    fn near_singular_innovation_respects_the_tolerance() {
        // F = 1e-10, far below a relative pivot tolerance of 1e-8.
        let system = scalar_system(0.0, 1e-5);
        let data = ObservedData::from_rows(1, 1, &[1e-5]).unwrap();

        let accepted = filter(&system.clone().into(), &data, &FilterOptions::default()).unwrap();
        assert!(accepted.log_likelihood.is_finite());
        assert_eq!(accepted.singular_tolerance, FilterOptions::default().singular_tolerance);

        let strict = FilterOptions::default().with_singular_tolerance(1e-8);
        let rejected = filter(&system.into(), &data, &strict);
        assert!(matches!(rejected, Err(DsgeError::SingularInnovation { period: 0 })));
    }

    #[test]
    fn explosive_transition_falls_back_to_diffuse_start() {
        let system = scalar_system(1.5, 1.0);
        let (mean, covariance) = initial_state(&system, &FilterOptions::default()).unwrap();
        assert_eq!(mean[0], 0.0);
        assert_eq!(covariance[(0, 0)], 1e6);
    }
}
