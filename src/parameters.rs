//! Structural parameters, their real-line transforms, and ordered parameter collections.
//!
//! Parameters are immutable values: every update returns a validated copy so that
//! parallel chains can share a starting [`ParameterSet`] without aliasing.

use std::collections::HashMap;

use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{DsgeError, Result};
use crate::priors::Prior;

/// Mapping between the model-space value of a parameter and the real line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// No transformation.
    Identity,
    /// Maps the real line onto the open interval `(a, b)` of the transform bounds.
    Bounded,
    /// Maps the real line onto `(a, ∞)`, with `b` acting as the offset.
    Exponential,
}

impl Transform {
    /// Maps a real-line value into model space.
    pub fn to_model(self, (a, b): (f64, f64), x: f64) -> f64 {
        let c = 1.0;
        match self {
            Self::Identity => x,
            Self::Bounded => {
                let cx = c * x;
                if cx.is_infinite() {
                    return if cx > 0.0 { b } else { a };
                }
                0.5 * (a + b) + 0.5 * (b - a) * (cx / cx.hypot(1.0))
            }
            Self::Exponential => a + (c * (x - b)).exp(),
        }
    }

    /// Maps a model-space value onto the real line, or `None` outside the open domain.
    pub fn to_real(self, (a, b): (f64, f64), value: f64) -> Option<f64> {
        let c = 1.0;
        match self {
            Self::Identity => Some(value),
            Self::Bounded => {
                let u = 2.0 * (value - 0.5 * (a + b)) / (b - a);
                (u.abs() < 1.0).then(|| u / (c * (1.0 - u * u).sqrt()))
            }
            Self::Exponential => (value > a).then(|| b + (value - a).ln() / c),
        }
    }
}

/// Affine map `offset + factor · value` producing the value used in equilibrium conditions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub offset: f64,
    pub factor: f64,
}

impl Scaling {
    /// `value / 100`, the usual annualized-percent convention.
    pub fn percent() -> Self {
        Self {
            offset: 0.0,
            factor: 0.01,
        }
    }

    /// `1 + value / 100`, for gross rates quoted in percent.
    pub fn gross_percent() -> Self {
        Self {
            offset: 1.0,
            factor: 0.01,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        self.offset + self.factor * value
    }
}

/// Role a parameter plays during estimation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Held at a single value; never estimated.
    Fixed,
    /// Estimated; enters the model unscaled.
    Free,
    /// Estimated; enters the model through a [`Scaling`].
    Scaled(Scaling),
    /// Recomputed by the model from the other parameters after every update.
    SteadyState,
}

/// A single structural coefficient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    key: String,
    value: f64,
    bounds: (f64, f64),
    transform: Transform,
    transform_bounds: (f64, f64),
    prior: Option<Prior>,
    kind: ParameterKind,
    description: String,
}

impl Parameter {
    /// Starts building a free parameter with the given key and initial value.
    pub fn builder<S: Into<String>>(key: S, value: f64) -> ParameterBuilder {
        ParameterBuilder::new(key.into(), value)
    }

    /// Shortcut for a fixed parameter.
    pub fn fixed<S: Into<String>>(key: S, value: f64) -> Result<Self> {
        Self::builder(key, value).fixed().build()
    }

    /// Shortcut for a steady-state parameter recomputed by the model.
    pub fn steady_state<S: Into<String>>(key: S, value: f64, description: &str) -> Self {
        Self {
            key: key.into(),
            value,
            bounds: (f64::NEG_INFINITY, f64::INFINITY),
            transform: Transform::Identity,
            transform_bounds: (f64::NEG_INFINITY, f64::INFINITY),
            prior: None,
            kind: ParameterKind::SteadyState,
            description: description.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unscaled model-space value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Value entering the equilibrium conditions (scaled when the kind carries a scaling).
    pub fn effective_value(&self) -> f64 {
        match self.kind {
            ParameterKind::Scaled(scaling) => scaling.apply(self.value),
            _ => self.value,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.bounds
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn transform_bounds(&self) -> (f64, f64) {
        self.transform_bounds
    }

    pub fn prior(&self) -> Option<&Prior> {
        self.prior.as_ref()
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, ParameterKind::Fixed)
    }

    /// Whether the parameter is estimated (free, scaled or unscaled).
    pub fn is_free(&self) -> bool {
        matches!(self.kind, ParameterKind::Free | ParameterKind::Scaled(_))
    }

    /// Whether `value` lies inside the closed value bounds.
    pub fn admits(&self, value: f64) -> bool {
        self.bounds.0 <= value && value <= self.bounds.1
    }

    /// Returns a copy holding `value`.
    ///
    /// Fixed parameters ignore the update and come back unchanged; use
    /// [`with_fixed_value`](Self::with_fixed_value) to move one.
    pub fn with_value(&self, value: f64) -> Result<Self> {
        match self.kind {
            ParameterKind::Fixed => {
                debug!("ignoring update of fixed parameter `{}` to {value}", self.key);
                Ok(self.clone())
            }
            ParameterKind::SteadyState => Ok(Self {
                value,
                ..self.clone()
            }),
            ParameterKind::Free | ParameterKind::Scaled(_) => {
                if value.is_nan() || !self.admits(value) {
                    return Err(self.bounds_violation(value));
                }
                Ok(Self {
                    value,
                    ..self.clone()
                })
            }
        }
    }

    /// Returns a fixed copy pinned at `value`, collapsing the bounds and dropping the prior.
    pub fn with_fixed_value(&self, value: f64) -> Self {
        Self {
            value,
            bounds: (value, value),
            transform: Transform::Identity,
            transform_bounds: (value, value),
            prior: None,
            kind: ParameterKind::Fixed,
            ..self.clone()
        }
    }

    /// Copy with the value clamped into the bounds (no-op for non-free parameters).
    pub fn clipped(&self, value: f64) -> Self {
        if !self.is_free() {
            return self.clone();
        }
        Self {
            value: value.clamp(self.bounds.0, self.bounds.1),
            ..self.clone()
        }
    }

    /// Maps a model-space value onto the real line through the parameter's transform.
    pub fn to_real(&self, value: f64) -> Result<f64> {
        self.transform
            .to_real(self.transform_bounds, value)
            .ok_or_else(|| DsgeError::TransformDomain {
                key: self.key.clone(),
                value,
            })
    }

    /// Maps a real-line value into model space through the parameter's transform.
    pub fn to_model(&self, x: f64) -> f64 {
        self.transform.to_model(self.transform_bounds, x)
    }

    /// Log prior density at the current unscaled value; zero without a prior or when not free.
    pub fn ln_prior(&self) -> f64 {
        match (&self.prior, self.is_free()) {
            (Some(prior), true) => prior.ln_pdf(self.value),
            _ => 0.0,
        }
    }

    fn bounds_violation(&self, value: f64) -> DsgeError {
        DsgeError::BoundsViolation {
            key: self.key.clone(),
            value,
            lower: self.bounds.0,
            upper: self.bounds.1,
        }
    }
}

/// Builder that validates bounds, transforms, and priors before constructing a [`Parameter`].
#[derive(Debug)]
pub struct ParameterBuilder {
    key: String,
    value: f64,
    bounds: Option<(f64, f64)>,
    transform: Transform,
    transform_bounds: Option<(f64, f64)>,
    prior: Option<Prior>,
    scaling: Option<Scaling>,
    fixed: bool,
    description: String,
}

impl ParameterBuilder {
    fn new(key: String, value: f64) -> Self {
        Self {
            key,
            value,
            bounds: None,
            transform: Transform::Identity,
            transform_bounds: None,
            prior: None,
            scaling: None,
            fixed: false,
            description: String::new(),
        }
    }

    /// Closed interval of admissible values.
    pub fn bounds(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = Some((lower, upper));
        self
    }

    /// Real-line transform; the transform bounds default to the value bounds.
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Overrides the interval parameterizing the transform.
    pub fn transform_bounds(mut self, a: f64, b: f64) -> Self {
        self.transform_bounds = Some((a, b));
        self
    }

    pub fn prior(mut self, prior: Prior) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Finalizes construction after validating bounds and the prior.
    pub fn build(self) -> Result<Parameter> {
        if !self.value.is_finite() {
            return Err(DsgeError::NumericalError {
                context: "parameter construction",
            });
        }

        if self.fixed {
            if self.prior.is_some() {
                return Err(DsgeError::FixedParameterPrior { key: self.key });
            }
            let kind = ParameterKind::Fixed;
            let value = match self.scaling {
                Some(scaling) => scaling.apply(self.value),
                None => self.value,
            };
            return Ok(Parameter {
                key: self.key,
                value,
                bounds: (value, value),
                transform: Transform::Identity,
                transform_bounds: (value, value),
                prior: None,
                kind,
                description: self.description,
            });
        }

        let bounds = self.bounds.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        if !(bounds.0 <= bounds.1) {
            return Err(DsgeError::invalid_option(
                "bounds",
                "lower bound exceeds upper bound",
            ));
        }
        if !(bounds.0 <= self.value && self.value <= bounds.1) {
            return Err(DsgeError::BoundsViolation {
                key: self.key,
                value: self.value,
                lower: bounds.0,
                upper: bounds.1,
            });
        }

        let transform_bounds = self.transform_bounds.unwrap_or(bounds);
        match self.transform {
            Transform::Bounded
                if !(transform_bounds.0.is_finite()
                    && transform_bounds.1.is_finite()
                    && transform_bounds.0 < transform_bounds.1) =>
            {
                return Err(DsgeError::invalid_option(
                    "transform_bounds",
                    "bounded transform needs a finite, non-empty interval",
                ));
            }
            Transform::Exponential if !transform_bounds.0.is_finite() => {
                return Err(DsgeError::invalid_option(
                    "transform_bounds",
                    "exponential transform needs a finite lower bound",
                ));
            }
            _ => {}
        }
        // An exponential transform with the default bounds uses a zero offset.
        let transform_bounds = match self.transform {
            Transform::Exponential if !transform_bounds.1.is_finite() => (transform_bounds.0, 0.0),
            _ => transform_bounds,
        };

        let kind = match self.scaling {
            Some(scaling) => ParameterKind::Scaled(scaling),
            None => ParameterKind::Free,
        };

        Ok(Parameter {
            key: self.key,
            value: self.value,
            bounds,
            transform: self.transform,
            transform_bounds,
            prior: self.prior,
            kind,
            description: self.description,
        })
    }
}

/// Ordered, key-indexed collection of parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    /// Builds a collection, rejecting duplicate keys.
    pub fn new(parameters: Vec<Parameter>) -> Result<Self> {
        let mut index = HashMap::with_capacity(parameters.len());
        for (position, parameter) in parameters.iter().enumerate() {
            if index.insert(parameter.key.clone(), position).is_some() {
                return Err(DsgeError::DuplicateParameter {
                    key: parameter.key.clone(),
                });
            }
        }
        Ok(Self { parameters, index })
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    /// Iterates over the estimated parameters in collection order.
    pub fn free(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.is_free())
    }

    /// Number of estimated parameters.
    pub fn free_count(&self) -> usize {
        self.free().count()
    }

    pub fn get(&self, key: &str) -> Result<&Parameter> {
        self.index
            .get(key)
            .map(|&position| &self.parameters[position])
            .ok_or_else(|| DsgeError::UnknownParameter {
                key: key.to_string(),
            })
    }

    /// Effective (scaled) value of the parameter named `key`.
    pub fn value(&self, key: &str) -> Result<f64> {
        self.get(key).map(Parameter::effective_value)
    }

    /// Unscaled values of the free parameters.
    pub fn free_values(&self) -> DVector<f64> {
        DVector::from_iterator(self.free_count(), self.free().map(Parameter::value))
    }

    /// Keys of the free parameters, in the order of [`free_values`](Self::free_values).
    pub fn free_keys(&self) -> Vec<&str> {
        self.free().map(Parameter::key).collect()
    }

    /// Returns a copy with the free parameters set to `values`, validating every bound.
    pub fn with_free_values(&self, values: &DVector<f64>) -> Result<Self> {
        self.map_free(values, |parameter, value| parameter.with_value(value))
    }

    /// Returns a copy with the free parameters set to `values` clamped into their bounds.
    pub fn with_clipped_free_values(&self, values: &DVector<f64>) -> Result<Self> {
        self.map_free(values, |parameter, value| Ok(parameter.clipped(value)))
    }

    /// Returns a copy with selected parameters updated by key.
    pub fn with_values(&self, updates: &[(&str, f64)]) -> Result<Self> {
        let mut parameters = self.parameters.clone();
        for &(key, value) in updates {
            let position = *self
                .index
                .get(key)
                .ok_or_else(|| DsgeError::UnknownParameter {
                    key: key.to_string(),
                })?;
            parameters[position] = parameters[position].with_value(value)?;
        }
        Ok(Self {
            parameters,
            index: self.index.clone(),
        })
    }

    /// Whether every free parameter admits the corresponding entry of `values`.
    pub fn admits(&self, values: &DVector<f64>) -> bool {
        values.len() == self.free_count()
            && self.free().zip(values.iter()).all(|(p, &v)| p.admits(v))
    }

    /// Maps free model-space values onto the real line.
    pub fn to_real(&self, values: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_free_len(values)?;
        let mapped = self
            .free()
            .zip(values.iter())
            .map(|(p, &v)| p.to_real(v))
            .collect::<Result<Vec<_>>>()?;
        Ok(DVector::from_vec(mapped))
    }

    /// Maps real-line values of the free parameters into model space.
    pub fn to_model(&self, values: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_free_len(values)?;
        Ok(DVector::from_iterator(
            values.len(),
            self.free().zip(values.iter()).map(|(p, &x)| p.to_model(x)),
        ))
    }

    /// Sum of the log prior densities of the free parameters.
    pub fn ln_prior(&self) -> f64 {
        self.parameters.iter().map(Parameter::ln_prior).sum()
    }

    fn map_free<F>(&self, values: &DVector<f64>, mut update: F) -> Result<Self>
    where
        F: FnMut(&Parameter, f64) -> Result<Parameter>,
    {
        self.check_free_len(values)?;
        let mut free_values = values.iter();
        let parameters = self
            .parameters
            .iter()
            .map(|parameter| {
                if parameter.is_free() {
                    match free_values.next() {
                        Some(&value) => update(parameter, value),
                        None => Ok(parameter.clone()),
                    }
                } else {
                    Ok(parameter.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            parameters,
            index: self.index.clone(),
        })
    }

    fn check_free_len(&self, values: &DVector<f64>) -> Result<()> {
        let expected = self.free_count();
        if values.len() != expected {
            return Err(DsgeError::dimension_mismatch(
                "free parameter vector",
                expected,
                values.len(),
            ));
        }
        Ok(())
    }
}
