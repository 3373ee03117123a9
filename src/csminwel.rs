//! Sims' csminwel quasi-Newton minimizer.
//!
//! Designed for objectives that are rough or undefined in places, as posterior
//! kernels of equilibrium models are: the gradient is taken by forward
//! differences and flagged when it blows up, the line search (`csminit`)
//! shrinks and grows the step adaptively, and when the search hits a wall the
//! direction is perturbed and, failing that, the cliff edge is traversed.

use log::{debug, info, trace, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::error::{DsgeError, Result};
use crate::options::ModeOptions;
use crate::posterior::LogPosterior;

const ANGLE: f64 = 0.005;
const THETA: f64 = 0.3;
const FCHANGE: f64 = 1000.0;
const MIN_LAMBDA: f64 = 1e-9;
const MIN_FACTOR_CHANGE: f64 = 0.01;
const BAD_GRADIENT: f64 = 1e15;
const BAD_START: f64 = 1e50;

/// How a line search ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineSearchOutcome {
    /// Normal termination with the improvement criteria satisfied.
    Improved,
    /// Gradient is numerically zero; no step taken.
    ZeroGradient,
    /// Step kept shrinking without meeting the improvement criterion.
    ShrinkStalled,
    /// Step became smaller than the minimum.
    MinimumStep,
    /// Step kept growing without settling.
    GrowStalled,
    /// Step became absurdly large.
    MaximumStep,
    /// Step against the gradient also fell below the minimum.
    ReversedMinimumStep,
    /// Step-size factor collapsed while the step was already large.
    FactorCollapsed,
    /// No search was performed.
    Skipped,
}

impl LineSearchOutcome {
    fn hit_wall(self) -> bool {
        matches!(self, Self::ShrinkStalled | Self::GrowStalled)
    }
}

/// Record of one iteration.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    pub x: DVector<f64>,
    pub value: f64,
    pub gradient: DVector<f64>,
}

/// Result of a minimization.
#[derive(Clone, Debug)]
pub struct ModeResult {
    pub x: DVector<f64>,
    pub value: f64,
    /// Objective change fell below `ftol` or the gradient vanished before the iteration cap.
    pub converged: bool,
    /// Final BFGS approximation of the inverse Hessian.
    pub inverse_hessian: DMatrix<f64>,
    pub iterations: usize,
    pub function_calls: usize,
    pub last_outcome: LineSearchOutcome,
    pub trace: Vec<TraceEntry>,
}

/// Counts evaluations and maps NaN to `+∞`.
struct Objective<F> {
    f: F,
    calls: usize,
}

impl<F> Objective<F>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    fn value(&mut self, x: &DVector<f64>) -> Result<f64> {
        self.calls += 1;
        let value = (self.f)(x)?;
        Ok(if value.is_nan() { f64::INFINITY } else { value })
    }

    /// Forward-difference gradient at `x` with objective value `f0`.
    ///
    /// Entries whose difference quotient exceeds `1e15` in magnitude are zeroed
    /// and the gradient is flagged as bad.
    fn gradient(
        &mut self,
        x: &DVector<f64>,
        f0: f64,
        delta: f64,
    ) -> Result<(DVector<f64>, bool)> {
        let mut g = DVector::zeros(x.len());
        let mut bad = false;
        let mut shifted = x.clone();
        for i in 0..x.len() {
            shifted[i] = x[i] + delta;
            let gi = (self.value(&shifted)? - f0) / delta;
            shifted[i] = x[i];
            if gi.abs() < BAD_GRADIENT {
                g[i] = gi;
            } else {
                g[i] = 0.0;
                bad = true;
            }
        }
        Ok((g, bad))
    }
}

/// Outcome of a line search.
struct Step {
    value: f64,
    x: DVector<f64>,
    outcome: LineSearchOutcome,
}

/// A candidate point together with its gradient, when one was computed.
struct Candidate {
    value: f64,
    x: DVector<f64>,
    gradient: Option<DVector<f64>>,
    bad_gradient: bool,
    outcome: LineSearchOutcome,
}

/// Minimizes `f` from `x0` with initial inverse Hessian `options.initial_inverse_hessian · I`.
pub fn minimize<F>(f: F, x0: &DVector<f64>, options: &ModeOptions) -> Result<ModeResult>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    let n = x0.len();
    let h0 = DMatrix::identity(n, n) * options.initial_inverse_hessian;
    minimize_with_inverse_hessian(f, x0, h0, options)
}

/// Minimizes `f` from `x0` starting from the inverse Hessian `h0`.
pub fn minimize_with_inverse_hessian<F>(
    f: F,
    x0: &DVector<f64>,
    h0: DMatrix<f64>,
    options: &ModeOptions,
) -> Result<ModeResult>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    let n = x0.len();
    if h0.shape() != (n, n) {
        return Err(DsgeError::dimension_mismatch(
            "initial inverse Hessian",
            n,
            h0.nrows(),
        ));
    }
    if !(options.gradient_step > 0.0) {
        return Err(DsgeError::invalid_option("gradient_step", "must be positive"));
    }

    let mut objective = Objective { f, calls: 0 };
    let mut rng = SmallRng::seed_from_u64(options.seed);
    let delta = options.gradient_step;
    let crit = options.ftol;

    let mut f_x = objective.value(x0)?;
    if f_x > BAD_START {
        return Err(DsgeError::InfeasibleStart { value: -f_x });
    }
    let (mut g, mut bad_g) = objective.gradient(x0, f_x, delta)?;
    let mut x = x0.clone();
    let mut h = h0;
    let mut trace_entries = Vec::new();
    let mut iterations = 0usize;
    let mut converged = false;
    let mut last_outcome: LineSearchOutcome;

    loop {
        iterations += 1;
        let first = line_search(&mut objective, &x, f_x, &g, bad_g, &h, options)?;
        let mut c1 = Candidate {
            value: first.value,
            x: first.x,
            gradient: None,
            bad_gradient: true,
            outcome: first.outcome,
        };
        let mut c2 = unimproved(&x, f_x);
        let mut c3 = unimproved(&x, f_x);

        if c1.outcome == LineSearchOutcome::ZeroGradient {
            c2.outcome = c1.outcome;
            c3.outcome = c1.outcome;
        } else {
            let wall1 = evaluate_gradient(&mut objective, &mut c1, delta)?;
            if wall1 && n > 1 {
                // Possibly at a cliff edge: perturb the search direction.
                let mut h_cliff = h.clone();
                for i in 0..n {
                    h_cliff[(i, i)] += h[(i, i)] * rng.gen::<f64>();
                }
                let second =
                    line_search(&mut objective, &x, f_x, &g, bad_g, &h_cliff, options)?;
                if second.value < f_x {
                    c2 = Candidate {
                        value: second.value,
                        x: second.x,
                        gradient: None,
                        bad_gradient: true,
                        outcome: second.outcome,
                    };
                    let wall2 = evaluate_gradient(&mut objective, &mut c2, delta)?;
                    if wall2 {
                        debug!("csminwel: cliff again, traversing");
                        let gap = &c2.x - &c1.x;
                        let gap_norm = gap.norm();
                        if gap_norm >= 1e-13 {
                            let g_cliff = gap * ((c2.value - c1.value) / (gap_norm * gap_norm));
                            let identity = DMatrix::identity(n, n);
                            let third = line_search(
                                &mut objective,
                                &x,
                                f_x,
                                &g_cliff,
                                false,
                                &identity,
                                options,
                            )?;
                            c3 = Candidate {
                                value: third.value,
                                x: third.x,
                                gradient: None,
                                bad_gradient: true,
                                outcome: third.outcome,
                            };
                            evaluate_gradient(&mut objective, &mut c3, delta)?;
                        }
                    }
                }
            }
        }

        let (chosen, bfgs_ok) = if c3.value < f_x - crit && !c3.bad_gradient {
            (c3, true)
        } else if c2.value < f_x - crit && !c2.bad_gradient {
            (c2, true)
        } else if c1.value < f_x - crit && !c1.bad_gradient {
            (c1, true)
        } else {
            let best = [c1, c2, c3]
                .into_iter()
                .reduce(|best, c| if c.value < best.value { c } else { best })
                .ok_or(DsgeError::NumericalError { context: "csminwel" })?;
            (best, false)
        };
        let Candidate {
            value: f_h,
            x: x_h,
            gradient,
            outcome,
            ..
        } = chosen;
        let g_h = match gradient {
            Some(gradient) => gradient,
            None => objective.gradient(&x_h, f_h, delta)?.0,
        };
        // a fallback pick never feeds the BFGS update, and its gradient is not trusted next round
        let bad_h = !bfgs_ok;

        let stuck = (f_h - f_x).abs() < crit;
        if !bad_g && !bad_h && !stuck {
            h = bfgs_update(&h, &(&g_h - &g), &(&x_h - &x));
        }
        trace!(
            "csminwel iteration {iterations}: f = {f_h:.10}, outcome {outcome:?}, {} calls",
            objective.calls
        );
        if options.store_trace {
            trace_entries.push(TraceEntry {
                x: x_h.clone(),
                value: f_h,
                gradient: g_h.clone(),
            });
        }

        f_x = f_h;
        x = x_h;
        g = g_h;
        bad_g = bad_h;
        last_outcome = outcome;

        if outcome == LineSearchOutcome::ZeroGradient || stuck {
            converged = true;
            break;
        }
        if iterations >= options.iterations {
            break;
        }
    }

    if converged {
        info!("csminwel converged after {iterations} iterations, f = {f_x:.8}");
    } else {
        warn!("csminwel stopped at the iteration cap ({iterations}), f = {f_x:.8}");
    }

    Ok(ModeResult {
        x,
        value: f_x,
        converged,
        inverse_hessian: h,
        iterations,
        function_calls: objective.calls,
        last_outcome,
        trace: trace_entries,
    })
}

fn unimproved(x: &DVector<f64>, f_x: f64) -> Candidate {
    Candidate {
        value: f_x,
        x: x.clone(),
        gradient: None,
        bad_gradient: true,
        outcome: LineSearchOutcome::Skipped,
    }
}

/// Computes the candidate's gradient unless the search ended at a wall.
///
/// Returns whether the candidate should be treated as sitting on a wall.
fn evaluate_gradient<F>(
    objective: &mut Objective<F>,
    candidate: &mut Candidate,
    delta: f64,
) -> Result<bool>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    if candidate.outcome.hit_wall() {
        candidate.bad_gradient = true;
        return Ok(true);
    }
    let (gradient, bad) = objective.gradient(&candidate.x, candidate.value, delta)?;
    candidate.gradient = Some(gradient);
    candidate.bad_gradient = bad;
    Ok(bad)
}

/// `csminit`: searches along `-H g` for a step meeting Sims' improvement criteria.
fn line_search<F>(
    objective: &mut Objective<F>,
    x0: &DVector<f64>,
    f0: f64,
    g0: &DVector<f64>,
    bad_g: bool,
    h0: &DMatrix<f64>,
    options: &ModeOptions,
) -> Result<Step>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    let g_norm = g0.norm();
    if g_norm < options.grtol && !bad_g {
        return Ok(Step {
            value: f0,
            x: x0.clone(),
            outcome: LineSearchOutcome::ZeroGradient,
        });
    }

    let mut dx = -(h0 * g0);
    let mut dx_norm = dx.norm();
    if dx_norm > 1e12 {
        debug!("csminit: near-singular inverse Hessian");
        dx *= FCHANGE / dx_norm;
        dx_norm = FCHANGE;
    }
    let mut df_hat = dx.dot(g0);
    if !bad_g {
        let alignment = -df_hat / (g_norm * dx_norm);
        if alignment < ANGLE {
            dx -= g0 * (ANGLE * dx_norm / g_norm + df_hat / (g_norm * g_norm));
            dx *= dx_norm / dx.norm();
            df_hat = dx.dot(g0);
            debug!("csminit: corrected for low angle {alignment:.3e}");
        }
    }

    let mut lambda = 1.0_f64;
    let mut factor = 3.0_f64;
    let mut shrink = true;
    let mut lambda_max = f64::INFINITY;
    let mut lambda_peak = 0.0_f64;
    let mut f_peak = f0;
    let mut f_hat = f0;
    let mut x_hat = x0.clone();

    let outcome = loop {
        let candidate = x0 + &dx * lambda;
        let f = objective.value(&candidate)?;
        if f < f_hat {
            f_hat = f;
            x_hat = candidate;
        }

        let shrink_signal = (!bad_g && f0 - f < (-THETA * df_hat * lambda).max(0.0))
            || (bad_g && f0 - f < 0.0);
        let grow_signal = !bad_g && lambda > 0.0 && f0 - f > -(1.0 - THETA) * df_hat * lambda;

        if shrink_signal && (lambda > lambda_peak || lambda < 0.0) {
            if lambda > 0.0 && (!shrink || lambda / factor <= lambda_peak) {
                shrink = true;
                factor = factor.powf(0.6);
                while lambda / factor <= lambda_peak {
                    factor = factor.powf(0.6);
                }
                if (factor - 1.0).abs() < MIN_FACTOR_CHANGE {
                    break if lambda.abs() < 4.0 {
                        LineSearchOutcome::ShrinkStalled
                    } else {
                        LineSearchOutcome::FactorCollapsed
                    };
                }
            }
            if lambda < lambda_max && lambda > lambda_peak {
                lambda_max = lambda;
            }
            lambda /= factor;
            if lambda.abs() < MIN_LAMBDA {
                if lambda > 0.0 && f0 <= f_hat {
                    // the gradient may be inaccurate; try the opposite direction
                    lambda = -lambda * factor.powi(6);
                } else if lambda < 0.0 {
                    break LineSearchOutcome::ReversedMinimumStep;
                } else {
                    break LineSearchOutcome::MinimumStep;
                }
            }
        } else if (grow_signal && lambda > 0.0)
            || (shrink_signal && lambda <= lambda_peak && lambda > 0.0)
        {
            if shrink {
                shrink = false;
                factor = factor.powf(0.6);
                if (factor - 1.0).abs() < MIN_FACTOR_CHANGE {
                    break if lambda.abs() < 4.0 {
                        LineSearchOutcome::GrowStalled
                    } else {
                        LineSearchOutcome::FactorCollapsed
                    };
                }
            }
            if f < f_peak && lambda > 0.0 {
                f_peak = f;
                lambda_peak = lambda;
                if lambda_max <= lambda_peak {
                    lambda_max = lambda_peak * factor * factor;
                }
            }
            lambda *= factor;
            if lambda.abs() > 1e20 {
                break LineSearchOutcome::MaximumStep;
            }
        } else if factor < 1.2 {
            break LineSearchOutcome::FactorCollapsed;
        } else {
            break LineSearchOutcome::Improved;
        }
    };

    Ok(Step {
        value: f_hat,
        x: x_hat,
        outcome,
    })
}

/// BFGS update of an inverse Hessian from a gradient change `dg` over a step `dx`.
///
/// Leaves `h` unchanged when `dgᵀdx` is numerically zero.
pub fn bfgs_update(h: &DMatrix<f64>, dg: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64> {
    let h_dg = h * dg;
    let dg_dx = dg.dot(dx);
    if dg_dx.abs() <= 1e-12 {
        debug!("bfgs update skipped: dgᵀdx = {dg_dx:e}");
        return h.clone();
    }
    let outer = dx * dx.transpose();
    let cross = &h_dg * dx.transpose() + dx * h_dg.transpose();
    h + outer * ((1.0 + dg.dot(&h_dg) / dg_dx) / dg_dx) - cross / dg_dx
}

/// Maximizes a log posterior by minimizing its negative from `x0`.
///
/// When a run stops without converging and `options.restarts > 0`, the search
/// restarts from the best point found, perturbed by `N(0, restart_scale²)`, and
/// the best result across runs is returned.
pub fn find_mode<P: LogPosterior + ?Sized>(
    posterior: &P,
    x0: &DVector<f64>,
    options: &ModeOptions,
) -> Result<ModeResult> {
    if x0.len() != posterior.dim() {
        return Err(DsgeError::dimension_mismatch(
            "mode starting point",
            posterior.dim(),
            x0.len(),
        ));
    }
    let objective = |x: &DVector<f64>| posterior.log_density(x).map(|value| -value);
    let mut best = minimize(objective, x0, options)?;
    let mut rng = SmallRng::seed_from_u64(options.seed.wrapping_add(1));

    for restart in 0..options.restarts {
        if best.converged {
            break;
        }
        let start = best.x.map(|xi| {
            let z: f64 = StandardNormal.sample(&mut rng);
            xi + options.restart_scale * z
        });
        info!("csminwel restart {} from a perturbed point", restart + 1);
        let candidate = match minimize(objective, &start, options) {
            Ok(candidate) => candidate,
            Err(DsgeError::InfeasibleStart { .. }) => continue,
            Err(err) => return Err(err),
        };
        if candidate.value <= best.value || (candidate.converged && !best.converged) {
            best = candidate;
        }
    }
    Ok(best)
}
