//! State-space systems assembled from a model and a parameter set.
//!
//! The engine never holds a mutable model object. A [`Model`] is a read-only
//! description of the equilibrium conditions and the measurement mapping, and
//! every evaluation threads an explicit `&ParameterSet` through it.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{DsgeError, Result};
use crate::gensys::{self, EquilibriumSystem, Transition};
use crate::options::SolverOptions;
use crate::parameters::ParameterSet;

/// Measurement equation `y_t = Z x_t + D + u_t` with `ε_t ~ N(0, Q)` and `u_t ~ N(0, E)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub zz: DMatrix<f64>,
    pub dd: DVector<f64>,
    /// Covariance of the structural shocks.
    pub qq: DMatrix<f64>,
    /// Covariance of the measurement errors.
    pub ee: DMatrix<f64>,
}

impl Measurement {
    /// Measurement without measurement error.
    pub fn new(zz: DMatrix<f64>, dd: DVector<f64>, qq: DMatrix<f64>) -> Self {
        let k = zz.nrows();
        Self {
            zz,
            dd,
            qq,
            ee: DMatrix::zeros(k, k),
        }
    }

    pub fn with_measurement_error(mut self, ee: DMatrix<f64>) -> Self {
        self.ee = ee;
        self
    }

    pub fn observable_count(&self) -> usize {
        self.zz.nrows()
    }
}

/// Which side of a regime boundary a system describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    PreBoundary,
    PostBoundary,
}

/// A model supplies equilibrium conditions and a measurement mapping.
///
/// Implementations must be `Sync`: chains and Hessian rows share one model
/// across threads.
pub trait Model: Sync {
    /// Canonical-form matrices `Γ0, Γ1, C, Ψ, Π` at the given parameters.
    fn equilibrium_conditions(&self, params: &ParameterSet) -> Result<EquilibriumSystem>;

    /// Measurement equation for the given (possibly augmented) transition law.
    fn measurement(
        &self,
        params: &ParameterSet,
        transition: &Transition,
        regime: Regime,
    ) -> Result<Measurement>;

    /// Recomputes the steady-state parameters after the free parameters changed.
    fn steady_state(&self, params: &ParameterSet) -> Result<ParameterSet> {
        Ok(params.clone())
    }

    /// Appends auxiliary states (lags, accumulators) to the solved transition.
    ///
    /// The leading block belonging to the solved states must be left untouched.
    fn augment_states(&self, _params: &ParameterSet, transition: Transition) -> Result<Transition> {
        Ok(transition)
    }
}

/// Transition and measurement of a linear Gaussian state-space model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub transition: Transition,
    pub measurement: Measurement,
}

impl System {
    /// Pairs a transition with a measurement after checking that their shapes agree.
    pub fn new(transition: Transition, measurement: Measurement) -> Result<Self> {
        let n = transition.state_count();
        let m = transition.shock_count();
        let k = measurement.observable_count();
        if measurement.zz.ncols() != n {
            return Err(DsgeError::dimension_mismatch(
                "Z columns",
                n,
                measurement.zz.ncols(),
            ));
        }
        if measurement.dd.len() != k {
            return Err(DsgeError::dimension_mismatch("D length", k, measurement.dd.len()));
        }
        if measurement.qq.shape() != (m, m) {
            return Err(DsgeError::dimension_mismatch("Q rows", m, measurement.qq.nrows()));
        }
        if measurement.ee.shape() != (k, k) {
            return Err(DsgeError::dimension_mismatch("E rows", k, measurement.ee.nrows()));
        }
        Ok(Self {
            transition,
            measurement,
        })
    }

    pub fn state_count(&self) -> usize {
        self.transition.state_count()
    }

    pub fn shock_count(&self) -> usize {
        self.transition.shock_count()
    }

    pub fn observable_count(&self) -> usize {
        self.measurement.observable_count()
    }

    /// State innovation covariance `R Q Rᵀ`.
    pub fn state_innovation_covariance(&self) -> DMatrix<f64> {
        let r = &self.transition.rrr;
        r * &self.measurement.qq * r.transpose()
    }
}

/// Solves the model at `params` and attaches the measurement of `regime`.
///
/// The result depends only on its inputs; repeated calls give identical systems.
pub fn assemble<M: Model + ?Sized>(
    model: &M,
    params: &ParameterSet,
    regime: Regime,
    options: &SolverOptions,
) -> Result<System> {
    let transition = solve_and_augment(model, params, options)?;
    let measurement = model.measurement(params, &transition, regime)?;
    System::new(transition, measurement)
}

fn solve_and_augment<M: Model + ?Sized>(
    model: &M,
    params: &ParameterSet,
    options: &SolverOptions,
) -> Result<Transition> {
    let conditions = model.equilibrium_conditions(params)?;
    let solved = gensys::solve(&conditions, options).map_err(|err| {
        debug!("equilibrium solver rejected parameters: {err}");
        err
    })?;
    let augmented = model.augment_states(params, solved.clone())?;
    check_augmentation(&solved, &augmented)?;
    Ok(augmented)
}

/// The solved states must remain the leading block of the augmented transition.
fn check_augmentation(solved: &Transition, augmented: &Transition) -> Result<()> {
    let n = solved.state_count();
    if augmented.state_count() < n {
        return Err(DsgeError::dimension_mismatch(
            "augmented state count",
            n,
            augmented.state_count(),
        ));
    }
    if augmented.shock_count() != solved.shock_count() {
        return Err(DsgeError::dimension_mismatch(
            "augmented shock count",
            solved.shock_count(),
            augmented.shock_count(),
        ));
    }
    let unchanged = |kept: &[f64], original: &[f64]| {
        kept.iter()
            .zip(original)
            .all(|(a, b)| (a - b).abs() <= 1e-12 * b.abs().max(1.0))
    };
    let ttt = augmented.ttt.view((0, 0), (n, n)).into_owned();
    if !unchanged(ttt.as_slice(), solved.ttt.as_slice()) {
        return Err(DsgeError::AugmentationAltered { block: "T" });
    }
    let rrr = augmented.rrr.rows(0, n).into_owned();
    if !unchanged(rrr.as_slice(), solved.rrr.as_slice()) {
        return Err(DsgeError::AugmentationAltered { block: "R" });
    }
    if !unchanged(&augmented.ccc.as_slice()[..n], solved.ccc.as_slice()) {
        return Err(DsgeError::AugmentationAltered { block: "C" });
    }
    Ok(())
}

/// Systems in force over the sample.
#[derive(Clone, Debug, PartialEq)]
pub enum RegimeSchedule {
    /// One system for every period.
    Single(System),
    /// `before` governs periods `< boundary`, `after` the remaining ones.
    Switching {
        before: System,
        after: System,
        boundary: usize,
    },
}

impl RegimeSchedule {
    /// Assembles the systems needed for a sample, switching at `boundary` when given.
    pub fn assemble<M: Model + ?Sized>(
        model: &M,
        params: &ParameterSet,
        options: &SolverOptions,
        boundary: Option<usize>,
    ) -> Result<Self> {
        let transition = solve_and_augment(model, params, options)?;
        let before = System::new(
            transition.clone(),
            model.measurement(params, &transition, Regime::PreBoundary)?,
        )?;
        match boundary {
            None => Ok(Self::Single(before)),
            Some(boundary) => {
                let after = System::new(
                    transition.clone(),
                    model.measurement(params, &transition, Regime::PostBoundary)?,
                )?;
                Self::switching(before, after, boundary)
            }
        }
    }

    /// Two systems sharing one state vector.
    pub fn switching(before: System, after: System, boundary: usize) -> Result<Self> {
        if before.state_count() != after.state_count() {
            return Err(DsgeError::dimension_mismatch(
                "post-boundary state count",
                before.state_count(),
                after.state_count(),
            ));
        }
        if before.observable_count() != after.observable_count() {
            return Err(DsgeError::dimension_mismatch(
                "post-boundary observable count",
                before.observable_count(),
                after.observable_count(),
            ));
        }
        Ok(Self::Switching {
            before,
            after,
            boundary,
        })
    }

    /// System governing `period`.
    pub fn system_at(&self, period: usize) -> &System {
        match self {
            Self::Single(system) => system,
            Self::Switching {
                before,
                after,
                boundary,
            } => {
                if period < *boundary {
                    before
                } else {
                    after
                }
            }
        }
    }

    /// Regime in force at `period`.
    pub fn regime_at(&self, period: usize) -> Regime {
        match self {
            Self::Switching { boundary, .. } if period >= *boundary => Regime::PostBoundary,
            _ => Regime::PreBoundary,
        }
    }

    /// System of the first period, which also fixes the initial state.
    pub fn initial(&self) -> &System {
        self.system_at(0)
    }
}

impl From<System> for RegimeSchedule {
    fn from(system: System) -> Self {
        Self::Single(system)
    }
}
