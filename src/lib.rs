//! Bayesian estimation of linearized dynamic stochastic general equilibrium (DSGE) models.
//!
//! The crate takes a model written as a linear rational-expectations system and
//! a set of structural parameters with priors, and provides
//!
//! - a parameter store with bounds, priors and real-line transforms (`parameters`, `priors`),
//! - Sims' gensys solver on top of an in-crate complex QZ decomposition (`gensys`, `qz`),
//! - state-space assembly, Kalman filtering and smoothing (`system`, `kalman`, `smoother`),
//! - a total posterior evaluator (`posterior`),
//! - the csminwel mode finder, a finite-difference Hessian and a random-walk
//!   Metropolis-Hastings sampler (`csminwel`, `hessian`, `metropolis`), and
//! - a driver that runs the three estimation stages end to end (`estimation`).
//!
//! Models implement the [`Model`] trait. The engine never mutates a model: every
//! evaluation threads an explicit [`ParameterSet`] through it, so a model can be
//! shared across the threads that run chains and Hessian rows.
//!
//! # Quick start
//!
//! ```no_run
//! use dsgers::gensys::{EquilibriumSystem, Transition};
//! use dsgers::{
//!     Estimation, EstimationOptions, Measurement, Model, ObservedData, Parameter, ParameterSet,
//!     Prior, Regime, Result, Transform,
//! };
//! use nalgebra::{DMatrix, DVector};
//!
//! /// x_t = ρ x_{t-1} + σ ε_t, observed without error.
//! struct Ar1;
//!
//! impl Model for Ar1 {
//!     fn equilibrium_conditions(&self, params: &ParameterSet) -> Result<EquilibriumSystem> {
//!         EquilibriumSystem::new(
//!             DMatrix::identity(1, 1),
//!             DMatrix::from_element(1, 1, params.value("rho")?),
//!             DMatrix::identity(1, 1),
//!             DMatrix::zeros(1, 0),
//!         )
//!     }
//!
//!     fn measurement(
//!         &self,
//!         params: &ParameterSet,
//!         _transition: &Transition,
//!         _regime: Regime,
//!     ) -> Result<Measurement> {
//!         let sigma = params.value("sigma")?;
//!         Ok(Measurement::new(
//!             DMatrix::identity(1, 1),
//!             DVector::zeros(1),
//!             DMatrix::from_element(1, 1, sigma * sigma),
//!         ))
//!     }
//! }
//!
//! let params = ParameterSet::new(vec![
//!     Parameter::builder("rho", 0.5)
//!         .bounds(0.0, 0.99)
//!         .transform(Transform::Bounded)
//!         .prior(Prior::beta_from_moments(0.5, 0.2)?)
//!         .build()?,
//!     Parameter::builder("sigma", 1.0)
//!         .bounds(0.01, 5.0)
//!         .transform(Transform::Exponential)
//!         .prior(Prior::root_inverse_gamma(2.0, 1.0)?)
//!         .build()?,
//! ])?;
//! let data = ObservedData::from_rows(4, 1, &[0.3, 0.1, -0.2, 0.4])?;
//!
//! let result = Estimation::new(&Ar1, params, &data)?.run(&EstimationOptions::default())?;
//! println!("posterior mean: {:?}", result.posterior_mean());
//! # Ok::<(), dsgers::DsgeError>(())
//! ```

pub mod csminwel;
pub mod data;
pub mod error;
pub mod estimation;
pub mod gensys;
pub mod hessian;
pub mod kalman;
pub mod linalg;
pub mod metropolis;
pub mod options;
pub mod parameters;
pub mod posterior;
pub mod priors;
pub mod qz;
pub mod smoother;
pub mod system;

pub use data::{ObservedData, ObservedDataBuilder};
pub use error::{DsgeError, Result};
pub use estimation::{Estimation, EstimationResult};
pub use options::{
    BoundsPolicy, EstimationOptions, FilterOptions, HessianOptions, InitialState, MhOptions,
    ModeOptions, SolverOptions,
};
pub use parameters::{Parameter, ParameterKind, ParameterSet, Scaling, Transform};
pub use posterior::{LogPosterior, Posterior};
pub use priors::Prior;
pub use system::{Measurement, Model, Regime, RegimeSchedule, System};
