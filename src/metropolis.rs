//! Random-walk Metropolis-Hastings sampling of a posterior.
//!
//! Proposals are `θ' = θ + c L z` with `z ~ N(0, I)` and `L Lᵀ` the proposal
//! covariance, usually the inverse Hessian at the mode. The scale `c` is tuned
//! toward a target acceptance band during burn-in and frozen afterwards.
//!
//! Draws are handed out in blocks by a lazy iterator. Each block draws its
//! randomness from a generator seeded by `(seed, block index)`, so a block can be
//! recomputed exactly from the chain state at its start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::error::{DsgeError, Result};
use crate::linalg::psd_factor;
use crate::options::MhOptions;
use crate::posterior::LogPosterior;

const TUNE_DOWN: f64 = 0.8;
const TUNE_UP: f64 = 1.25;
const BURN_IN_STREAM: u64 = 0;

/// Current position of a chain.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainState {
    pub theta: DVector<f64>,
    pub log_posterior: f64,
    /// Proposal scale `c`.
    pub scale: f64,
    pub accepted: usize,
    pub proposed: usize,
}

impl ChainState {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Retained draws of one block.
#[derive(Clone, Debug)]
pub struct MhBlock {
    pub index: usize,
    pub draws: Vec<DVector<f64>>,
    pub log_posteriors: Vec<f64>,
    pub accepted: usize,
    pub proposed: usize,
    /// Chain state when the block started; [`Sampler::run_block`] reproduces the block from it.
    pub start: ChainState,
    /// False when the block was cut short by cancellation.
    pub complete: bool,
}

impl MhBlock {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Random-walk Metropolis-Hastings sampler over a [`LogPosterior`].
pub struct Sampler<'a, P: LogPosterior + ?Sized> {
    posterior: &'a P,
    factor: DMatrix<f64>,
    options: MhOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, P: LogPosterior + ?Sized> Sampler<'a, P> {
    /// Builds a sampler whose proposals have covariance `c² · proposal_covariance`.
    pub fn new(
        posterior: &'a P,
        proposal_covariance: &DMatrix<f64>,
        options: MhOptions,
    ) -> Result<Self> {
        let d = posterior.dim();
        if proposal_covariance.shape() != (d, d) {
            return Err(DsgeError::dimension_mismatch(
                "proposal covariance",
                d,
                proposal_covariance.nrows(),
            ));
        }
        Self::from_factor(posterior, psd_factor(proposal_covariance), options)
    }

    /// Builds a sampler from a factor `L` of the proposal covariance.
    pub fn from_factor(
        posterior: &'a P,
        factor: DMatrix<f64>,
        options: MhOptions,
    ) -> Result<Self> {
        let d = posterior.dim();
        if factor.nrows() != d {
            return Err(DsgeError::dimension_mismatch(
                "proposal factor rows",
                d,
                factor.nrows(),
            ));
        }
        options.validate()?;
        Ok(Self {
            posterior,
            factor,
            options,
            cancel: None,
        })
    }

    /// Stops sampling after the current draw once `token` is set.
    pub fn with_cancel_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Options the sampler was built with.
    pub fn options(&self) -> &MhOptions {
        &self.options
    }

    /// Lazily runs burn-in followed by `n_blocks` blocks from `start`.
    pub fn run_chain(&self, start: &DVector<f64>) -> Result<MhChain<'_, 'a, P>> {
        let state = self.initial_state(start)?;
        Ok(MhChain {
            sampler: self,
            pending_burn_in: Some(state),
            state: None,
            next_block: 0,
            finished: false,
        })
    }

    /// Runs one chain per starting point in parallel and collects every block.
    pub fn run_chains(&self, starts: &[DVector<f64>]) -> Result<Vec<Vec<MhBlock>>> {
        starts
            .par_iter()
            .enumerate()
            .map(|(chain, start)| {
                let sampler = self.for_chain(chain);
                let blocks = sampler.run_chain(start)?.collect::<Result<Vec<_>>>()?;
                info!("chain {chain} finished with {} blocks", blocks.len());
                Ok(blocks)
            })
            .collect()
    }

    /// Evaluates the start and rejects points of zero posterior density.
    pub fn initial_state(&self, start: &DVector<f64>) -> Result<ChainState> {
        let d = self.posterior.dim();
        if start.len() != d {
            return Err(DsgeError::dimension_mismatch("chain start", d, start.len()));
        }
        let log_posterior = self.posterior.log_density(start)?;
        if !(log_posterior > f64::NEG_INFINITY) {
            return Err(DsgeError::InfeasibleStart {
                value: log_posterior,
            });
        }
        Ok(ChainState {
            theta: start.clone(),
            log_posterior,
            scale: self.options.scale,
            accepted: 0,
            proposed: 0,
        })
    }

    /// Runs the burn-in from `state`, tuning the scale when enabled.
    ///
    /// Returns `None` when cancelled.
    pub fn burn_in(&self, mut state: ChainState) -> Result<Option<ChainState>> {
        let mut rng = SmallRng::seed_from_u64(stream_seed(self.options.seed, BURN_IN_STREAM));
        let (low, high) = self.options.target_acceptance;
        let mut window_accepted = 0usize;

        for draw in 0..self.options.burn_in {
            if self.step(&mut state, &mut rng)? {
                window_accepted += 1;
            }
            if self.cancelled() {
                return Ok(None);
            }
            let interval = self.options.tune_interval;
            if self.options.tune_scale && (draw + 1) % interval == 0 {
                let rate = window_accepted as f64 / interval as f64;
                if rate < low {
                    state.scale *= TUNE_DOWN;
                } else if rate > high {
                    state.scale *= TUNE_UP;
                }
                debug!(
                    "burn-in draw {}: acceptance {rate:.3}, scale {:.4}",
                    draw + 1,
                    state.scale
                );
                window_accepted = 0;
            }
        }

        info!(
            "burn-in finished: {} draws, acceptance {:.3}, scale {:.4}",
            self.options.burn_in,
            state.acceptance_rate(),
            state.scale
        );
        state.accepted = 0;
        state.proposed = 0;
        Ok(Some(state))
    }

    /// Runs block `index` from `start`, returning the block and the state after it.
    pub fn run_block(&self, start: &ChainState, index: usize) -> Result<(MhBlock, ChainState)> {
        let mut rng = SmallRng::seed_from_u64(stream_seed(self.options.seed, index as u64 + 1));
        let mut state = start.clone();
        let kept = self.options.block_size / self.options.thinning;
        let mut block = MhBlock {
            index,
            draws: Vec::with_capacity(kept),
            log_posteriors: Vec::with_capacity(kept),
            accepted: 0,
            proposed: 0,
            start: start.clone(),
            complete: true,
        };

        for draw in 0..self.options.block_size {
            if self.step(&mut state, &mut rng)? {
                block.accepted += 1;
            }
            block.proposed += 1;
            if (draw + 1) % self.options.thinning == 0 {
                block.draws.push(state.theta.clone());
                block.log_posteriors.push(state.log_posterior);
            }
            if self.cancelled() {
                block.complete = false;
                break;
            }
        }
        Ok((block, state))
    }

    /// One proposal and accept/reject decision. Returns whether the proposal was accepted.
    fn step<R: Rng + ?Sized>(&self, state: &mut ChainState, rng: &mut R) -> Result<bool> {
        let d = state.theta.len();
        let z = DVector::from_iterator(d, (0..d).map(|_| StandardNormal.sample(&mut *rng)));
        let proposal = &state.theta + (&self.factor * z) * state.scale;
        // drawn unconditionally so the random stream does not depend on the posterior
        let u: f64 = rng.gen();

        let log_posterior = self.posterior.log_density(&proposal)?;
        state.proposed += 1;
        let accept = log_posterior > f64::NEG_INFINITY
            && u.ln() < log_posterior - state.log_posterior;
        if accept {
            state.theta = proposal;
            state.log_posterior = log_posterior;
            state.accepted += 1;
        }
        Ok(accept)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |token| token.load(Ordering::Relaxed))
    }

    fn for_chain(&self, chain: usize) -> Sampler<'a, P> {
        let mut options = self.options.clone();
        options.seed = stream_seed(self.options.seed ^ 0x5851_F42D_4C95_7F2D, chain as u64 + 1);
        Sampler {
            posterior: self.posterior,
            factor: self.factor.clone(),
            options,
            cancel: self.cancel.clone(),
        }
    }
}

/// Lazy sequence of blocks of one chain.
pub struct MhChain<'s, 'a, P: LogPosterior + ?Sized> {
    sampler: &'s Sampler<'a, P>,
    pending_burn_in: Option<ChainState>,
    state: Option<ChainState>,
    next_block: usize,
    finished: bool,
}

impl<P: LogPosterior + ?Sized> MhChain<'_, '_, P> {
    /// Chain state after the last completed block, once burn-in has run.
    pub fn state(&self) -> Option<&ChainState> {
        self.state.as_ref()
    }
}

impl<P: LogPosterior + ?Sized> Iterator for MhChain<'_, '_, P> {
    type Item = Result<MhBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(initial) = self.pending_burn_in.take() {
            match self.sampler.burn_in(initial) {
                Ok(Some(state)) => self.state = Some(state),
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        if self.next_block >= self.sampler.options.n_blocks {
            self.finished = true;
            return None;
        }
        let state = self.state.as_ref()?;
        match self.sampler.run_block(state, self.next_block) {
            Ok((block, state)) => {
                info!(
                    "block {} done: {} draws kept, acceptance {:.3}",
                    block.index,
                    block.draws.len(),
                    block.acceptance_rate()
                );
                self.next_block += 1;
                self.finished = !block.complete;
                self.state = Some(state);
                Some(Ok(block))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Seed of an independent random stream derived from a base seed.
fn stream_seed(seed: u64, stream: u64) -> u64 {
    // splitmix64 finalizer
    let mut z = seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::FnPosterior;

    fn standard_normal_target() -> FnPosterior<impl Fn(&DVector<f64>) -> Result<f64> + Sync> {
        FnPosterior::new(1, |x: &DVector<f64>| Ok(-0.5 * x[0] * x[0]))
    }

    #[test]
    fn blocks_are_reproducible_from_their_start() {
        let target = standard_normal_target();
        let options = MhOptions::default().with_blocks(3, 50).with_burn_in(100);
        let sampler = Sampler::new(&target, &DMatrix::identity(1, 1), options).unwrap();
        let blocks = sampler
            .run_chain(&DVector::zeros(1))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(blocks.len(), 3);
        let (replayed, _) = sampler.run_block(&blocks[1].start, 1).unwrap();
        assert_eq!(replayed.draws, blocks[1].draws);
        assert_eq!(blocks[2].start.theta, *blocks[1].draws.last().unwrap());
    }

    #[test]
    fn thinning_keeps_every_kth_draw() {
        let target = standard_normal_target();
        let options = MhOptions::default()
            .with_blocks(1, 100)
            .with_burn_in(0)
            .with_thinning(4);
        let sampler = Sampler::new(&target, &DMatrix::identity(1, 1), options).unwrap();
        let mut chain = sampler.run_chain(&DVector::zeros(1)).unwrap();
        let block = chain.next().unwrap().unwrap();
        assert_eq!(block.draws.len(), 25);
        assert_eq!(block.proposed, 100);
    }

    #[test]
    fn cancellation_stops_after_the_current_draw() {
        let target = standard_normal_target();
        let token = Arc::new(AtomicBool::new(true));
        let options = MhOptions::default().with_blocks(5, 100).with_burn_in(0);
        let sampler = Sampler::new(&target, &DMatrix::identity(1, 1), options)
            .unwrap()
            .with_cancel_token(token);
        let blocks: Vec<_> = sampler.run_chain(&DVector::zeros(1)).unwrap().collect();
        assert_eq!(blocks.len(), 1);
        let block = blocks[0].as_ref().unwrap();
        assert!(!block.complete);
        assert_eq!(block.proposed, 1);
    }

    #[test]
    fn infeasible_start_is_rejected() {
        let target = FnPosterior::new(1, |x: &DVector<f64>| {
            Ok(if x[0] < 0.0 { f64::NEG_INFINITY } else { 0.0 })
        });
        let sampler =
            Sampler::new(&target, &DMatrix::identity(1, 1), MhOptions::default()).unwrap();
        assert!(matches!(
            sampler.run_chain(&DVector::from_element(1, -1.0)),
            Err(DsgeError::InfeasibleStart { .. })
        ));
    }
}
