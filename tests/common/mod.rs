#![allow(dead_code)]

use dsgers::gensys::{EquilibriumSystem, Transition};
use dsgers::{
    Measurement, Model, ObservedData, Parameter, ParameterSet, Prior, Regime, Result, Transform,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// `x_t = ρ x_{t-1} + ε_t`, `ε_t ~ N(0, σ²)`, observed as `y_t = x_t + u_t`.
pub struct Ar1 {
    pub measurement_error: f64,
}

impl Ar1 {
    pub fn exact() -> Self {
        Self {
            measurement_error: 0.0,
        }
    }
}

impl Model for Ar1 {
    fn equilibrium_conditions(&self, params: &ParameterSet) -> Result<EquilibriumSystem> {
        EquilibriumSystem::new(
            DMatrix::identity(1, 1),
            DMatrix::from_element(1, 1, params.value("rho")?),
            DMatrix::identity(1, 1),
            DMatrix::zeros(1, 0),
        )
    }

    fn measurement(
        &self,
        params: &ParameterSet,
        _transition: &Transition,
        _regime: Regime,
    ) -> Result<Measurement> {
        let sigma = params.value("sigma")?;
        Ok(Measurement::new(
            DMatrix::identity(1, 1),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, sigma * sigma),
        )
        .with_measurement_error(DMatrix::from_element(1, 1, self.measurement_error)))
    }
}

/// `rho` in (0, 0.99) with a beta prior and `sigma` in (0.01, 5) with an inverse-gamma prior.
pub fn ar1_params(rho: f64, sigma: f64) -> ParameterSet {
    ParameterSet::new(vec![
        Parameter::builder("rho", rho)
            .bounds(0.0, 0.99)
            .transform(Transform::Bounded)
            .prior(Prior::beta_from_moments(0.5, 0.2).unwrap())
            .build()
            .unwrap(),
        Parameter::builder("sigma", sigma)
            .bounds(0.01, 5.0)
            .transform(Transform::Exponential)
            .prior(Prior::root_inverse_gamma(2.0, 1.0).unwrap())
            .build()
            .unwrap(),
    ])
    .unwrap()
}

/// `rho` on (0, 2) without priors, so the explosive region is reachable.
pub fn unrestricted_ar1_params(rho: f64, sigma: f64) -> ParameterSet {
    ParameterSet::new(vec![
        Parameter::builder("rho", rho).bounds(0.0, 2.0).build().unwrap(),
        Parameter::builder("sigma", sigma)
            .bounds(0.01, 5.0)
            .build()
            .unwrap(),
    ])
    .unwrap()
}

pub fn simulate_ar1(rho: f64, sigma: f64, periods: usize, seed: u64) -> ObservedData {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut x = 0.0;
    let values: Vec<f64> = (0..periods)
        .map(|_| {
            let e: f64 = StandardNormal.sample(&mut rng);
            x = rho * x + sigma * e;
            x
        })
        .collect();
    ObservedData::from_rows(periods, 1, &values).unwrap()
}

/// `x_t = a E_t x_{t+1} + z_t`, `z_t = ρ z_{t-1} + ε_t`, states `(x_t, z_t, E_t x_{t+1})`.
pub fn forward_looking_system(a: f64, rho: f64) -> EquilibriumSystem {
    let gamma0 = DMatrix::from_row_slice(
        3,
        3,
        &[
            1.0, -1.0, -a, //
            0.0, 1.0, 0.0, //
            1.0, 0.0, 0.0,
        ],
    );
    let mut gamma1 = DMatrix::zeros(3, 3);
    gamma1[(1, 1)] = rho;
    gamma1[(2, 2)] = 1.0;
    let psi = DMatrix::from_column_slice(3, 1, &[0.0, 1.0, 0.0]);
    let pi = DMatrix::from_column_slice(3, 1, &[0.0, 0.0, 1.0]);
    EquilibriumSystem::new(gamma0, gamma1, psi, pi).unwrap()
}

/// Covariance of `T` consecutive observations of a stationary AR(1).
pub fn ar1_covariance(rho: f64, sigma: f64, periods: usize) -> DMatrix<f64> {
    let variance = sigma * sigma / (1.0 - rho * rho);
    DMatrix::from_fn(periods, periods, |i, j| {
        variance * rho.powi((i as i32 - j as i32).abs())
    })
}
