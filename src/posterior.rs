//! Posterior evaluation: likelihood of the data plus the log prior.
//!
//! Evaluation is total over the parameter space. Draws the model cannot handle
//! (out of bounds, no determinate equilibrium, degenerate filter) score
//! negative infinity; only malformed inputs such as vectors of the wrong length
//! surface as errors.

use log::trace;
use nalgebra::DVector;

use crate::data::ObservedData;
use crate::error::{DsgeError, Result};
use crate::kalman::{self, KalmanOutput};
use crate::options::{BoundsPolicy, FilterOptions, SolverOptions};
use crate::parameters::ParameterSet;
use crate::system::{Model, RegimeSchedule};

/// A log density over a fixed-dimensional parameter vector.
pub trait LogPosterior: Sync {
    /// Length of the parameter vector.
    fn dim(&self) -> usize;

    /// Log density at `theta`; `Ok(f64::NEG_INFINITY)` marks an infeasible point.
    fn log_density(&self, theta: &DVector<f64>) -> Result<f64>;
}

/// Components of a posterior evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PosteriorValue {
    pub log_likelihood: f64,
    pub log_prior: f64,
}

impl PosteriorValue {
    pub fn total(&self) -> f64 {
        self.log_likelihood + self.log_prior
    }
}

/// Posterior of a model's free parameters given observed data.
pub struct Posterior<'a, M: Model + ?Sized> {
    model: &'a M,
    params: ParameterSet,
    data: &'a ObservedData,
    solver: SolverOptions,
    filter: FilterOptions,
    policy: BoundsPolicy,
}

impl<'a, M: Model + ?Sized> Posterior<'a, M> {
    pub fn new(model: &'a M, params: ParameterSet, data: &'a ObservedData) -> Self {
        Self {
            model,
            params,
            data,
            solver: SolverOptions::default(),
            filter: FilterOptions::default(),
            policy: BoundsPolicy::default(),
        }
    }

    pub fn with_solver_options(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_filter_options(mut self, filter: FilterOptions) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_bounds_policy(mut self, policy: BoundsPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The parameter set whose free entries are replaced on every evaluation.
    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    pub fn data(&self) -> &ObservedData {
        self.data
    }

    pub fn bounds_policy(&self) -> BoundsPolicy {
        self.policy
    }

    /// Log posterior at the free-parameter values `values` (model space).
    pub fn log_posterior(&self, values: &DVector<f64>) -> Result<f64> {
        match self.evaluate(values) {
            Ok(value) => Ok(value.total()),
            Err(err) if err.is_infeasible_draw() => {
                trace!("infeasible draw: {err}");
                Ok(f64::NEG_INFINITY)
            }
            Err(err) => Err(err),
        }
    }

    /// Likelihood and prior at `values`, reporting infeasibility as an error.
    pub fn evaluate(&self, values: &DVector<f64>) -> Result<PosteriorValue> {
        let params = self.updated(values)?;
        let log_prior = params.ln_prior();
        if log_prior == f64::NEG_INFINITY {
            return Ok(PosteriorValue {
                log_likelihood: f64::NEG_INFINITY,
                log_prior,
            });
        }
        let output = self.filter_at(&params)?;
        Ok(PosteriorValue {
            log_likelihood: output.log_likelihood,
            log_prior,
        })
    }

    /// Parameter set at `values` with steady-state entries recomputed.
    pub fn updated(&self, values: &DVector<f64>) -> Result<ParameterSet> {
        let params = match self.policy {
            BoundsPolicy::Reject => self.params.with_free_values(values)?,
            BoundsPolicy::Clip => self.params.with_clipped_free_values(values)?,
        };
        self.model.steady_state(&params)
    }

    /// State-space systems implied by an updated parameter set.
    pub fn schedule(&self, params: &ParameterSet) -> Result<RegimeSchedule> {
        RegimeSchedule::assemble(self.model, params, &self.solver, self.filter.regime_boundary)
    }

    /// Filter output at an updated parameter set.
    pub fn filter_at(&self, params: &ParameterSet) -> Result<KalmanOutput> {
        let schedule = self.schedule(params)?;
        kalman::filter(&schedule, self.data, &self.filter)
    }

    /// View of this posterior over real-line coordinates of the free parameters.
    pub fn real_line(&self) -> RealLine<'_, Self> {
        RealLine {
            params: &self.params,
            target: self,
        }
    }
}

impl<M: Model + ?Sized> LogPosterior for Posterior<'_, M> {
    fn dim(&self) -> usize {
        self.params.free_count()
    }

    fn log_density(&self, theta: &DVector<f64>) -> Result<f64> {
        self.log_posterior(theta)
    }
}

/// A posterior over the real line obtained by mapping through the parameter transforms.
pub struct RealLine<'a, P: LogPosterior + ?Sized> {
    params: &'a ParameterSet,
    target: &'a P,
}

impl<'a, P: LogPosterior + ?Sized> RealLine<'a, P> {
    pub fn new(params: &'a ParameterSet, target: &'a P) -> Self {
        Self { params, target }
    }

    /// Maps real-line coordinates back to model space.
    pub fn to_model(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.params.to_model(x)
    }
}

impl<P: LogPosterior + ?Sized> LogPosterior for RealLine<'_, P> {
    fn dim(&self) -> usize {
        self.target.dim()
    }

    fn log_density(&self, x: &DVector<f64>) -> Result<f64> {
        let values = self.params.to_model(x)?;
        self.target.log_density(&values)
    }
}

/// Adapts a closure into a [`LogPosterior`].
pub struct FnPosterior<F> {
    dim: usize,
    density: F,
}

impl<F> FnPosterior<F>
where
    F: Fn(&DVector<f64>) -> Result<f64> + Sync,
{
    pub fn new(dim: usize, density: F) -> Self {
        Self { dim, density }
    }
}

impl<F> LogPosterior for FnPosterior<F>
where
    F: Fn(&DVector<f64>) -> Result<f64> + Sync,
{
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_density(&self, theta: &DVector<f64>) -> Result<f64> {
        if theta.len() != self.dim {
            return Err(DsgeError::dimension_mismatch(
                "posterior argument",
                self.dim,
                theta.len(),
            ));
        }
        (self.density)(theta)
    }
}
