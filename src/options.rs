//! Configuration structures for the solver, filter, optimizer, Hessian and sampler.
//!
//! Every struct implements `Default` with the values used in practice and loads
//! from any `serde` format, filling unspecified fields from the defaults.

use serde::{Deserialize, Serialize};

use crate::error::{DsgeError, Result};

/// Tolerances used by [`gensys::solve`](crate::gensys::solve).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Roots with modulus below `div` are treated as stable.
    pub div: f64,
    /// Diagonal pairs with both entries below this magnitude are coincident zeros.
    pub coincident_zero_tol: f64,
    /// Singular values at or below this are treated as zero in rank tests.
    pub rank_tol: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            div: 1.0 + 1e-6,
            coincident_zero_tol: 1e-6,
            rank_tol: 1e-6,
        }
    }
}

impl SolverOptions {
    /// Sets the stability threshold on root moduli.
    pub fn with_div(mut self, div: f64) -> Self {
        self.div = div;
        self
    }

    /// Sets the singular-value cutoff of the rank tests.
    pub fn with_rank_tolerance(mut self, tolerance: f64) -> Self {
        self.rank_tol = tolerance;
        self
    }
}

/// How the filter picks the distribution of the initial state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InitialState {
    /// Unconditional moments when the transition is stable, diffuse otherwise.
    Stationary,
    /// Mean `C` and covariance `diffuse_scale · I`.
    Diffuse,
    /// Caller-supplied mean and covariance (row-major, `n × n`).
    Given { mean: Vec<f64>, covariance: Vec<f64> },
}

/// Options for [`kalman::filter`](crate::kalman::filter).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOptions {
    /// Leading periods that are filtered but left out of the likelihood.
    pub presample: usize,
    /// Distribution of the state before the first period.
    pub initial_state: InitialState,
    /// Variance scale of the diffuse initial covariance.
    pub diffuse_scale: f64,
    /// Convergence tolerance of the doubling Lyapunov solver.
    pub lyapunov_tolerance: f64,
    /// Doubling steps allowed before the start falls back to diffuse.
    pub lyapunov_max_iterations: usize,
    /// Innovation covariances whose smallest squared Cholesky pivot is at or below
    /// `singular_tolerance` times their largest diagonal entry count as singular.
    pub singular_tolerance: f64,
    /// First period governed by the post-boundary system, when regimes switch.
    pub regime_boundary: Option<usize>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            presample: 0,
            initial_state: InitialState::Stationary,
            diffuse_scale: 1e6,
            lyapunov_tolerance: 1e-12,
            lyapunov_max_iterations: 200,
            singular_tolerance: 1e-14,
            regime_boundary: None,
        }
    }
}

impl FilterOptions {
    /// Leaves the first `periods` periods out of the likelihood.
    pub fn with_presample(mut self, periods: usize) -> Self {
        self.presample = periods;
        self
    }

    /// Sets how the initial state distribution is chosen.
    pub fn with_initial_state(mut self, initial_state: InitialState) -> Self {
        self.initial_state = initial_state;
        self
    }

    /// Switches to the post-boundary system from `boundary` on.
    pub fn with_regime_boundary(mut self, boundary: usize) -> Self {
        self.regime_boundary = Some(boundary);
        self
    }

    /// Sets the relative pivot below which an innovation covariance is singular.
    pub fn with_singular_tolerance(mut self, tolerance: f64) -> Self {
        self.singular_tolerance = tolerance;
        self
    }
}

/// Treatment of out-of-bounds proposals by the posterior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundsPolicy {
    /// Out-of-bounds values give a log posterior of negative infinity.
    Reject,
    /// Out-of-bounds values are clamped into the bounds before evaluation.
    Clip,
}

impl Default for BoundsPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Options for [`csminwel::minimize`](crate::csminwel::minimize).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeOptions {
    /// Maximum number of quasi-Newton iterations.
    pub iterations: usize,
    /// Stop when an iteration improves the objective by less than this.
    pub ftol: f64,
    /// Stop when every gradient entry is below this.
    pub grtol: f64,
    /// Forward-difference step of the numerical gradient.
    pub gradient_step: f64,
    /// Scale of the initial inverse Hessian `H0 = scale · I`.
    pub initial_inverse_hessian: f64,
    /// Additional runs from a perturbed start when a run does not converge.
    pub restarts: usize,
    /// Standard deviation of the restart perturbation, in real-line coordinates.
    pub restart_scale: f64,
    /// Record `(x, f, gradient)` at every iteration.
    pub store_trace: bool,
    pub seed: u64,
}

impl Default for ModeOptions {
    fn default() -> Self {
        Self {
            iterations: 100,
            ftol: 1e-10,
            grtol: 1e-12,
            gradient_step: 1e-6,
            initial_inverse_hessian: 1e-4,
            restarts: 0,
            restart_scale: 0.1,
            store_trace: false,
            seed: 0,
        }
    }
}

impl ModeOptions {
    /// Caps the number of quasi-Newton iterations.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the objective-improvement stopping tolerance.
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    /// Sets how many perturbed restarts follow a non-converged run.
    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }

    /// Records the iterates in the result when enabled.
    pub fn with_trace(mut self, store_trace: bool) -> Self {
        self.store_trace = store_trace;
        self
    }

    /// Seeds the cliff and restart perturbations.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Options for [`hessian::estimate_hessian`](crate::hessian::estimate_hessian).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HessianOptions {
    /// Relative step of the central differences.
    pub step: f64,
    /// Smallest eigenvalue kept when correcting to positive definite.
    pub min_eigenvalue: f64,
}

impl Default for HessianOptions {
    fn default() -> Self {
        Self {
            step: 1e-4,
            min_eigenvalue: 1e-8,
        }
    }
}

impl HessianOptions {
    /// Sets the relative step of the central differences.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }
}

/// Options for the Metropolis-Hastings sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MhOptions {
    /// Number of blocks kept after burn-in.
    pub n_blocks: usize,
    /// Draws generated per block, before thinning.
    pub block_size: usize,
    /// Draws discarded before the first block.
    pub burn_in: usize,
    /// Keep every `thinning`-th draw.
    pub thinning: usize,
    /// Initial proposal scale `c`.
    pub scale: f64,
    /// Adapt `c` during burn-in.
    pub tune_scale: bool,
    /// Acceptance band targeted while tuning.
    pub target_acceptance: (f64, f64),
    /// Draws between scale adjustments during burn-in.
    pub tune_interval: usize,
    pub seed: u64,
}

impl Default for MhOptions {
    fn default() -> Self {
        Self {
            n_blocks: 10,
            block_size: 1_000,
            burn_in: 1_000,
            thinning: 1,
            scale: 0.3,
            tune_scale: true,
            target_acceptance: (0.2, 0.4),
            tune_interval: 100,
            seed: 42,
        }
    }
}

impl MhOptions {
    /// Sets the number of blocks and the draws per block.
    pub fn with_blocks(mut self, n_blocks: usize, block_size: usize) -> Self {
        self.n_blocks = n_blocks;
        self.block_size = block_size;
        self
    }

    /// Sets the number of discarded burn-in draws.
    pub fn with_burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = burn_in;
        self
    }

    /// Keeps every `thinning`-th draw; zero is raised to one.
    pub fn with_thinning(mut self, thinning: usize) -> Self {
        self.thinning = thinning.max(1);
        self
    }

    /// Sets the initial proposal scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Enables or disables scale tuning during burn-in.
    pub fn with_tuning(mut self, tune_scale: bool) -> Self {
        self.tune_scale = tune_scale;
        self
    }

    /// Seeds the burn-in and block streams.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Checks the values that would otherwise make the sampler loop or divide by zero.
    pub fn validate(&self) -> Result<()> {
        if self.thinning == 0 {
            return Err(DsgeError::invalid_option("thinning", "must be positive"));
        }
        if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(DsgeError::invalid_option("scale", "must be positive and finite"));
        }
        if self.tune_scale && self.tune_interval == 0 {
            return Err(DsgeError::invalid_option("tune_interval", "must be positive"));
        }
        let (low, high) = self.target_acceptance;
        if !(0.0 < low && low < high && high < 1.0) {
            return Err(DsgeError::invalid_option(
                "target_acceptance",
                "must satisfy 0 < low < high < 1",
            ));
        }
        Ok(())
    }
}

/// Aggregated configuration of a full estimation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    pub solver: SolverOptions,
    pub filter: FilterOptions,
    pub mode: ModeOptions,
    pub hessian: HessianOptions,
    pub mh: MhOptions,
    /// Skip the mode search and start the Hessian at the initial parameters.
    pub skip_mode: bool,
}

impl EstimationOptions {
    /// Replaces the solver options.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    /// Replaces the filter options.
    pub fn with_filter(mut self, filter: FilterOptions) -> Self {
        self.filter = filter;
        self
    }

    /// Replaces the mode-search options.
    pub fn with_mode(mut self, mode: ModeOptions) -> Self {
        self.mode = mode;
        self
    }

    /// Replaces the Hessian options.
    pub fn with_hessian(mut self, hessian: HessianOptions) -> Self {
        self.hessian = hessian;
        self
    }

    /// Replaces the sampler options.
    pub fn with_mh(mut self, mh: MhOptions) -> Self {
        self.mh = mh;
        self
    }

    /// Starts sampling from the initial values without a mode search.
    pub fn with_skip_mode(mut self, skip_mode: bool) -> Self {
        self.skip_mode = skip_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_preserve_other_defaults() {
        let options = EstimationOptions::default()
            .with_mh(MhOptions::default().with_blocks(2, 50).with_thinning(0));
        assert_eq!(options.mh.n_blocks, 2);
        assert_eq!(options.mh.block_size, 50);
        assert_eq!(options.mh.thinning, 1);
        assert_eq!(options.solver, SolverOptions::default());
    }

    #[test]
    fn mh_validation_rejects_inverted_band() {
        let mut options = MhOptions::default();
        options.target_acceptance = (0.5, 0.3);
        assert!(matches!(
            options.validate(),
            Err(DsgeError::InvalidOption {
                option: "target_acceptance",
                ..
            })
        ));
    }
}
