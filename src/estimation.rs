//! End-to-end Bayesian estimation: posterior mode, Hessian, then Metropolis-Hastings.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};
use nalgebra::DVector;

use crate::csminwel::{self, ModeResult};
use crate::data::ObservedData;
use crate::error::{DsgeError, Result};
use crate::hessian::{self, HessianResult};
use crate::metropolis::{MhBlock, Sampler};
use crate::options::{BoundsPolicy, EstimationOptions};
use crate::parameters::ParameterSet;
use crate::posterior::{LogPosterior, Posterior};
use crate::system::Model;

/// A model, its parameters and the data to estimate them on.
pub struct Estimation<'a, M: Model + ?Sized> {
    model: &'a M,
    params: ParameterSet,
    data: &'a ObservedData,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, M: Model + ?Sized> Estimation<'a, M> {
    /// Constructs an estimation problem; at least one parameter must be free.
    pub fn new(model: &'a M, params: ParameterSet, data: &'a ObservedData) -> Result<Self> {
        if params.free_count() == 0 {
            return Err(DsgeError::dimension_mismatch("free parameters", 1, 0));
        }
        Ok(Self {
            model,
            params,
            data,
            cancel: None,
        })
    }

    /// Stops the sampler after its current draw once `token` is set.
    pub fn with_cancel_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Parameter set the estimation starts from.
    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    /// Posterior with the given bounds policy and the configured solver and filter.
    pub fn posterior(&self, options: &EstimationOptions, policy: BoundsPolicy) -> Posterior<'a, M> {
        Posterior::new(self.model, self.params.clone(), self.data)
            .with_solver_options(options.solver.clone())
            .with_filter_options(options.filter.clone())
            .with_bounds_policy(policy)
    }

    /// Maximizes the posterior over real-line coordinates of the free parameters.
    ///
    /// Returns the mode in model space together with the optimizer result.
    pub fn find_mode(&self, options: &EstimationOptions) -> Result<(DVector<f64>, ModeResult)> {
        let posterior = self.posterior(options, BoundsPolicy::Clip);
        let start = self.params.to_real(&self.params.free_values())?;
        let result = csminwel::find_mode(&posterior.real_line(), &start, &options.mode)?;
        let mode = self.params.to_model(&result.x)?;
        let clipped = self.params.with_clipped_free_values(&mode)?.free_values();
        info!(
            "posterior mode found: log posterior {:.6} after {} iterations",
            -result.value, result.iterations
        );
        Ok((clipped, result))
    }

    /// Hessian of the negative log posterior at `at` (model space).
    pub fn hessian_at(
        &self,
        at: &DVector<f64>,
        options: &EstimationOptions,
    ) -> Result<HessianResult> {
        let posterior = self.posterior(options, BoundsPolicy::Clip);
        hessian::estimate_hessian(
            |theta: &DVector<f64>| posterior.log_density(theta).map(|value| -value),
            at,
            &options.hessian,
        )
    }

    /// Runs mode search, Hessian estimation and the sampler.
    pub fn run(&self, options: &EstimationOptions) -> Result<EstimationResult> {
        let (mode, mode_result) = if options.skip_mode {
            (self.params.free_values(), None)
        } else {
            let (mode, result) = self.find_mode(options)?;
            if !result.converged {
                warn!("mode search did not converge; continuing from the best point found");
            }
            (mode, Some(result))
        };

        let hessian = self.hessian_at(&mode, options)?;
        if hessian.corrected {
            warn!(
                "Hessian at the mode was corrected ({} eigenvalues clipped)",
                hessian.clipped
            );
        }

        let posterior = self.posterior(options, BoundsPolicy::Reject);
        let mode_log_posterior = posterior.log_posterior(&mode)?;
        let mut sampler =
            Sampler::from_factor(&posterior, hessian.factor.clone(), options.mh.clone())?;
        if let Some(token) = &self.cancel {
            sampler = sampler.with_cancel_token(Arc::clone(token));
        }
        let blocks = sampler.run_chain(&mode)?.collect::<Result<Vec<_>>>()?;

        let (accepted, proposed) = blocks
            .iter()
            .fold((0, 0), |(a, p), block| (a + block.accepted, p + block.proposed));
        let acceptance_rate = if proposed == 0 {
            0.0
        } else {
            accepted as f64 / proposed as f64
        };
        info!(
            "sampling finished: {} blocks, acceptance rate {acceptance_rate:.3}",
            blocks.len()
        );

        Ok(EstimationResult {
            parameters: self.params.with_free_values(&mode)?,
            mode,
            mode_log_posterior,
            mode_result,
            hessian,
            blocks,
            acceptance_rate,
        })
    }
}

/// Outcome of an estimation run.
#[derive(Clone, Debug)]
pub struct EstimationResult {
    /// Free-parameter values at the mode (model space).
    pub mode: DVector<f64>,
    /// Log posterior at the mode.
    pub mode_log_posterior: f64,
    /// Parameter set holding the mode.
    pub parameters: ParameterSet,
    /// Optimizer diagnostics; absent when the mode search was skipped.
    pub mode_result: Option<ModeResult>,
    /// Hessian at the mode and the proposal covariance derived from it.
    pub hessian: HessianResult,
    /// Retained sampler blocks in chain order.
    pub blocks: Vec<MhBlock>,
    /// Acceptance rate over all retained blocks.
    pub acceptance_rate: f64,
}

impl EstimationResult {
    /// All retained draws in chain order.
    pub fn draws(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.blocks.iter().flat_map(|block| block.draws.iter())
    }

    /// Posterior mean of the retained draws.
    pub fn posterior_mean(&self) -> Option<DVector<f64>> {
        let count = self.draws().count();
        if count == 0 {
            return None;
        }
        let sum = self
            .draws()
            .fold(DVector::zeros(self.mode.len()), |acc, draw| acc + draw);
        Some(sum / count as f64)
    }
}
