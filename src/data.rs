//! Observed time-series containers and validation utilities used by the filter.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};

use crate::error::{DsgeError, Result};

/// Observations arranged as periods × series; `NaN` marks a missing value.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedData {
    series: Vec<String>,
    values: DMatrix<f64>,
}

impl ObservedData {
    /// Creates data with generated series names `y0, y1, ...`.
    pub fn new(values: DMatrix<f64>) -> Result<Self> {
        let series = (0..values.ncols()).map(|j| format!("y{j}")).collect();
        ObservedDataBuilder::new(values).series(series).build()
    }

    /// Creates data from row-major period observations.
    pub fn from_rows(periods: usize, series: usize, values: &[f64]) -> Result<Self> {
        if values.len() != periods * series {
            return Err(DsgeError::dimension_mismatch(
                "observation count",
                periods * series,
                values.len(),
            ));
        }
        Self::new(DMatrix::from_row_slice(periods, series, values))
    }

    /// Number of periods.
    pub fn period_count(&self) -> usize {
        self.values.nrows()
    }

    /// Number of observed series.
    pub fn series_count(&self) -> usize {
        self.values.ncols()
    }

    /// Series names, in column order.
    pub fn series_names(&self) -> &[String] {
        &self.series
    }

    /// Position of the series called `name`.
    pub fn series_index(&self, name: &str) -> Option<usize> {
        self.series.iter().position(|s| s == name)
    }

    /// Returns a read-only view of the full observation matrix.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Observations of one period as a column vector.
    pub fn period(&self, t: usize) -> DVector<f64> {
        self.values.row(t).transpose()
    }

    /// Indices of the series observed in period `t`.
    pub fn observed_in(&self, t: usize) -> Vec<usize> {
        self.values
            .row(t)
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .map(|(j, _)| j)
            .collect()
    }

    /// Number of non-missing values in the sample.
    pub fn observation_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }
}

/// Builder that validates names and values before constructing [`ObservedData`].
#[derive(Debug)]
pub struct ObservedDataBuilder {
    values: DMatrix<f64>,
    series: Option<Vec<String>>,
}

impl ObservedDataBuilder {
    pub fn new(values: DMatrix<f64>) -> Self {
        Self {
            values,
            series: None,
        }
    }

    /// Sets the series names, one per column.
    pub fn series(mut self, names: Vec<String>) -> Self {
        self.series = Some(names);
        self
    }

    /// Finalizes construction after validating shapes and entries.
    pub fn build(self) -> Result<ObservedData> {
        let k = self.values.ncols();
        let series = self
            .series
            .unwrap_or_else(|| (0..k).map(|j| format!("y{j}")).collect());
        if series.len() != k {
            return Err(DsgeError::dimension_mismatch("series names", k, series.len()));
        }
        let mut seen = HashSet::new();
        for name in &series {
            if !seen.insert(name.as_str()) {
                return Err(DsgeError::invalid_option("series", "names must be unique"));
            }
        }
        // Infinite entries are data errors, not missing values.
        if self.values.iter().any(|v| v.is_infinite()) {
            return Err(DsgeError::NumericalError {
                context: "observed data validation",
            });
        }
        Ok(ObservedData {
            series,
            values: self.values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_are_tracked_per_period() {
        let data = ObservedData::from_rows(2, 3, &[1.0, f64::NAN, 2.0, f64::NAN, f64::NAN, f64::NAN])
            .expect("valid data");
        assert_eq!(data.period_count(), 2);
        assert_eq!(data.observed_in(0), vec![0, 2]);
        assert!(data.observed_in(1).is_empty());
        assert_eq!(data.observation_count(), 2);
        assert_eq!(data.period(0)[2], 2.0);
    }

    #[test]
    fn builder_rejects_bad_names_and_infinities() {
        let values = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let duplicated = ObservedDataBuilder::new(values.clone())
            .series(vec!["gdp".into(), "gdp".into()])
            .build();
        assert!(matches!(duplicated, Err(DsgeError::InvalidOption { .. })));

        let infinite = ObservedData::new(DMatrix::from_row_slice(1, 1, &[f64::INFINITY]));
        assert!(matches!(infinite, Err(DsgeError::NumericalError { .. })));
    }
}
