//! Prior densities over structural parameters.
//!
//! Every prior is stored through its hyperparameters so that parameter sets
//! remain `Clone + Send + Sync` and serializable; the density itself is
//! evaluated through `statrs`.

use log::warn;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, Continuous, Gamma, InverseGamma, Normal, Uniform};
use statrs::function::gamma::ln_gamma;

use crate::error::{DsgeError, Result};

/// Prior distribution attached to a free parameter.
///
/// Deserialization checks the hyperparameters the same way the constructors do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PriorSpec")]
pub enum Prior {
    /// Gaussian with the given mean and standard deviation.
    Normal { mean: f64, std: f64 },
    /// Beta on the unit interval with shape parameters `alpha` and `beta`.
    Beta { alpha: f64, beta: f64 },
    /// Gamma with shape `k` and scale `theta`.
    Gamma { shape: f64, scale: f64 },
    /// Inverse gamma with shape `alpha` and scale `beta`.
    InverseGamma { shape: f64, scale: f64 },
    /// Density of `σ` when `σ²` is inverse gamma with `ν/2` and `ντ²/2`.
    RootInverseGamma { nu: f64, tau: f64 },
    /// Flat density on `[low, high]`.
    Uniform { low: f64, high: f64 },
}

/// Unchecked wire form of [`Prior`].
#[derive(Deserialize)]
enum PriorSpec {
    Normal { mean: f64, std: f64 },
    Beta { alpha: f64, beta: f64 },
    Gamma { shape: f64, scale: f64 },
    InverseGamma { shape: f64, scale: f64 },
    RootInverseGamma { nu: f64, tau: f64 },
    Uniform { low: f64, high: f64 },
}

impl TryFrom<PriorSpec> for Prior {
    type Error = DsgeError;

    fn try_from(spec: PriorSpec) -> Result<Self> {
        match spec {
            PriorSpec::Normal { mean, std } => Self::normal(mean, std),
            PriorSpec::Beta { alpha, beta } => Self::beta(alpha, beta),
            PriorSpec::Gamma { shape, scale } => Self::gamma(shape, scale),
            PriorSpec::InverseGamma { shape, scale } => Self::inverse_gamma(shape, scale),
            PriorSpec::RootInverseGamma { nu, tau } => Self::root_inverse_gamma(nu, tau),
            PriorSpec::Uniform { low, high } => Self::uniform(low, high),
        }
    }
}

impl Prior {
    /// Normal prior.
    pub fn normal(mean: f64, std: f64) -> Result<Self> {
        if !mean.is_finite() {
            return Err(invalid("normal mean must be finite"));
        }
        positive("normal std", std)?;
        Ok(Self::Normal { mean, std })
    }

    /// Beta prior with shape parameters `alpha` and `beta`.
    pub fn beta(alpha: f64, beta: f64) -> Result<Self> {
        positive("beta alpha", alpha)?;
        positive("beta beta", beta)?;
        Ok(Self::Beta { alpha, beta })
    }

    /// Gamma prior with the given shape and scale.
    pub fn gamma(shape: f64, scale: f64) -> Result<Self> {
        positive("gamma shape", shape)?;
        positive("gamma scale", scale)?;
        Ok(Self::Gamma { shape, scale })
    }

    /// Inverse gamma prior with the given shape and scale.
    pub fn inverse_gamma(shape: f64, scale: f64) -> Result<Self> {
        positive("inverse gamma shape", shape)?;
        positive("inverse gamma scale", scale)?;
        Ok(Self::InverseGamma { shape, scale })
    }

    /// Beta prior parameterized by its mean and standard deviation.
    pub fn beta_from_moments(mean: f64, std: f64) -> Result<Self> {
        if !(0.0 < mean && mean < 1.0) {
            return Err(invalid("beta mean must lie in (0, 1)"));
        }
        positive("beta std", std)?;
        let var = std * std;
        let common = mean * (1.0 - mean) / var - 1.0;
        if common <= 0.0 {
            return Err(invalid("beta variance too large for its mean"));
        }
        Ok(Self::Beta {
            alpha: mean * common,
            beta: (1.0 - mean) * common,
        })
    }

    /// Gamma prior parameterized by its mean and standard deviation.
    pub fn gamma_from_moments(mean: f64, std: f64) -> Result<Self> {
        positive("gamma mean", mean)?;
        positive("gamma std", std)?;
        let scale = std * std / mean;
        Ok(Self::Gamma {
            shape: mean / scale,
            scale,
        })
    }

    /// Root inverse gamma prior as used for shock standard deviations.
    pub fn root_inverse_gamma(nu: f64, tau: f64) -> Result<Self> {
        positive("root inverse gamma nu", nu)?;
        positive("root inverse gamma tau", tau)?;
        Ok(Self::RootInverseGamma { nu, tau })
    }

    /// Uniform prior.
    pub fn uniform(low: f64, high: f64) -> Result<Self> {
        if !(low < high && low.is_finite() && high.is_finite()) {
            return Err(invalid("uniform bounds must be finite with low < high"));
        }
        Ok(Self::Uniform { low, high })
    }

    /// Log density at `x`; negative infinity outside the support.
    pub fn ln_pdf(&self, x: f64) -> f64 {
        let density = match *self {
            Self::Normal { mean, std } => Normal::new(mean, std).ok().map(|d| d.ln_pdf(x)),
            Self::Beta { alpha, beta } => {
                if !(0.0 < x && x < 1.0) {
                    return f64::NEG_INFINITY;
                }
                Beta::new(alpha, beta).ok().map(|d| d.ln_pdf(x))
            }
            Self::Gamma { shape, scale } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                Gamma::new(shape, 1.0 / scale).ok().map(|d| d.ln_pdf(x))
            }
            Self::InverseGamma { shape, scale } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                InverseGamma::new(shape, scale).ok().map(|d| d.ln_pdf(x))
            }
            Self::RootInverseGamma { nu, tau } => return root_inverse_gamma_ln_pdf(nu, tau, x),
            Self::Uniform { low, high } => {
                if x < low || x > high {
                    return f64::NEG_INFINITY;
                }
                Uniform::new(low, high).ok().map(|d| d.ln_pdf(x))
            }
        };
        density.unwrap_or_else(|| {
            warn!("prior {self:?} has invalid hyperparameters, density taken as zero");
            f64::NEG_INFINITY
        })
    }

    /// Mean of the distribution, when it exists.
    pub fn mean(&self) -> Option<f64> {
        match *self {
            Self::Normal { mean, .. } => Some(mean),
            Self::Beta { alpha, beta } => Some(alpha / (alpha + beta)),
            Self::Gamma { shape, scale } => Some(shape * scale),
            Self::InverseGamma { shape, scale } => (shape > 1.0).then(|| scale / (shape - 1.0)),
            Self::RootInverseGamma { nu, tau } => (nu > 1.0).then(|| {
                let half = 0.5 * nu;
                let log_ratio = ln_gamma(half - 0.5) - ln_gamma(half);
                (half).sqrt() * tau * log_ratio.exp()
            }),
            Self::Uniform { low, high } => Some(0.5 * (low + high)),
        }
    }
}

fn root_inverse_gamma_ln_pdf(nu: f64, tau: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let half = 0.5 * nu;
    std::f64::consts::LN_2 - ln_gamma(half) + half * (half * tau * tau).ln()
        - (nu + 1.0) * x.ln()
        - half * tau * tau / (x * x)
}

fn positive(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DsgeError::InvalidPrior {
            reason: format!("{what} must be positive and finite, found {value}"),
        })
    }
}

fn invalid(reason: &str) -> DsgeError {
    DsgeError::InvalidPrior {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn beta_from_moments_recovers_mean() {
        let prior = Prior::beta_from_moments(0.7, 0.1).unwrap();
        assert_relative_eq!(prior.mean().unwrap(), 0.7, epsilon = 1e-12);
        assert_eq!(prior.ln_pdf(1.2), f64::NEG_INFINITY);
    }

    #[test]
    fn gamma_from_moments_matches_closed_form_density() {
        let prior = Prior::gamma_from_moments(2.0, 1.0).unwrap();
        // shape 4, scale 0.5: log p(x) = -ln Γ(4) - 4 ln 0.5 + 3 ln x - x / 0.5
        let x = 1.3_f64;
        let expected = -(6.0_f64).ln() - 4.0 * 0.5_f64.ln() + 3.0 * x.ln() - x / 0.5;
        assert_relative_eq!(prior.ln_pdf(x), expected, epsilon = 1e-10);
    }

    #[test]
    fn root_inverse_gamma_integrates_to_one() {
        let prior = Prior::root_inverse_gamma(4.0, 0.5).unwrap();
        let step = 1e-4;
        let mass: f64 = (1..100_000)
            .map(|i| prior.ln_pdf(i as f64 * step).exp() * step)
            .sum();
        assert_relative_eq!(mass, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        assert!(matches!(
            Prior::normal(0.0, -1.0),
            Err(DsgeError::InvalidPrior { .. })
        ));
        assert!(Prior::beta_from_moments(0.5, 0.6).is_err());
        assert!(Prior::uniform(1.0, 1.0).is_err());
        assert!(Prior::gamma(0.0, 1.0).is_err());
    }

    #[test]
    fn deserialization_validates_hyperparameters() {
        let prior: Prior =
            serde_json::from_str(r#"{"Beta": {"alpha": 2.0, "beta": 3.0}}"#).unwrap();
        assert_eq!(prior, Prior::beta(2.0, 3.0).unwrap());

        let round_trip: Prior =
            serde_json::from_str(&serde_json::to_string(&prior).unwrap()).unwrap();
        assert_eq!(round_trip, prior);

        for bad in [
            r#"{"Normal": {"mean": 0.0, "std": -1.0}}"#,
            r#"{"Gamma": {"shape": 0.0, "scale": 1.0}}"#,
            r#"{"Uniform": {"low": 2.0, "high": 1.0}}"#,
        ] {
            assert!(serde_json::from_str::<Prior>(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn hand_built_invalid_prior_has_zero_density() {
        let prior = Prior::InverseGamma {
            shape: -1.0,
            scale: 1.0,
        };
        assert_eq!(prior.ln_pdf(0.5), f64::NEG_INFINITY);
    }
}
