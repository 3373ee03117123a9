//! Finite-difference Hessian of an objective at a point.
//!
//! Rows are evaluated in parallel with `rayon`; the objective must therefore be
//! `Sync`. The raw estimate is corrected to the nearest positive-definite matrix
//! by raising small or negative eigenvalues, and the proposal covariance used by
//! the sampler is the inverse of the corrected matrix.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{DsgeError, Result};
use crate::linalg::clip_eigenvalues;
use crate::options::HessianOptions;

/// Hessian estimate with its positive-definite correction.
#[derive(Clone, Debug)]
pub struct HessianResult {
    /// Symmetric central-difference estimate.
    pub hessian: DMatrix<f64>,
    /// Nearest matrix with eigenvalues at least `min_eigenvalue`.
    pub positive_definite: DMatrix<f64>,
    /// Whether any eigenvalue had to be raised.
    pub corrected: bool,
    /// Number of eigenvalues raised.
    pub clipped: usize,
    /// Inverse of [`positive_definite`](Self::positive_definite).
    pub covariance: DMatrix<f64>,
    /// `L` with `L Lᵀ = covariance`.
    pub factor: DMatrix<f64>,
}

/// Central-difference Hessian of `f` at `x` with steps `h_i = step · max(|x_i|, 1)`.
pub fn estimate_hessian<F>(
    f: F,
    x: &DVector<f64>,
    options: &HessianOptions,
) -> Result<HessianResult>
where
    F: Fn(&DVector<f64>) -> Result<f64> + Sync,
{
    let n = x.len();
    if !(options.step > 0.0) {
        return Err(DsgeError::invalid_option("step", "must be positive"));
    }
    if !(options.min_eigenvalue > 0.0) {
        return Err(DsgeError::invalid_option("min_eigenvalue", "must be positive"));
    }

    let steps: Vec<f64> = x.iter().map(|xi| options.step * xi.abs().max(1.0)).collect();
    let f0 = f(x)?;
    if !f0.is_finite() {
        return Err(DsgeError::HessianNotFinite { row: 0, col: 0 });
    }

    let rows = (0..n)
        .into_par_iter()
        .map(|i| hessian_row(&f, x, f0, &steps, i))
        .collect::<Result<Vec<Vec<f64>>>>()?;

    let mut hessian = DMatrix::zeros(n, n);
    for (i, row) in rows.iter().enumerate() {
        for (offset, &value) in row.iter().enumerate() {
            let j = i + offset;
            if !value.is_finite() {
                return Err(DsgeError::HessianNotFinite { row: i, col: j });
            }
            hessian[(i, j)] = value;
            hessian[(j, i)] = value;
        }
    }

    let (positive_definite, eigen, clipped) = clip_eigenvalues(&hessian, options.min_eigenvalue);
    if clipped > 0 {
        warn!("Hessian is not positive definite; raised {clipped} of {n} eigenvalues");
    } else {
        debug!("Hessian is positive definite");
    }

    let mut factor = eigen.eigenvectors.clone();
    for (j, &lambda) in eigen.eigenvalues.iter().enumerate() {
        factor.column_mut(j).scale_mut(lambda.sqrt().recip());
    }
    let covariance = &factor * factor.transpose();

    Ok(HessianResult {
        hessian,
        positive_definite,
        corrected: clipped > 0,
        clipped,
        covariance,
        factor,
    })
}

/// Entries `(i, j)` for `j >= i`.
fn hessian_row<F>(
    f: &F,
    x: &DVector<f64>,
    f0: f64,
    steps: &[f64],
    i: usize,
) -> Result<Vec<f64>>
where
    F: Fn(&DVector<f64>) -> Result<f64>,
{
    let n = x.len();
    let hi = steps[i];
    let mut row = Vec::with_capacity(n - i);

    let mut point = x.clone();
    point[i] = x[i] + hi;
    let up = f(&point)?;
    point[i] = x[i] - hi;
    let down = f(&point)?;
    row.push((up - 2.0 * f0 + down) / (hi * hi));

    for j in (i + 1)..n {
        let hj = steps[j];
        let mut corner = |si: f64, sj: f64| {
            point.copy_from(x);
            point[i] += si * hi;
            point[j] += sj * hj;
            f(&point)
        };
        let pp = corner(1.0, 1.0)?;
        let pm = corner(1.0, -1.0)?;
        let mp = corner(-1.0, 1.0)?;
        let mm = corner(-1.0, -1.0)?;
        row.push((pp - pm - mp + mm) / (4.0 * hi * hj));
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn quadratic_hessian_is_recovered() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let f = |x: &DVector<f64>| Ok(0.5 * x.dot(&(&a * x)));
        let x = DVector::from_vec(vec![0.3, -1.2, 2.5]);
        let result = estimate_hessian(f, &x, &HessianOptions::default()).unwrap();
        assert_relative_eq!(result.hessian, a, epsilon = 1e-5);
        assert!(!result.corrected);
        let identity = &result.covariance * &a;
        assert_relative_eq!(identity, DMatrix::identity(3, 3), epsilon = 1e-4);
    }

    #[test]
    fn saddle_is_corrected_and_flagged() {
        let f = |x: &DVector<f64>| Ok(x[0] * x[0] - x[1] * x[1]);
        let result = estimate_hessian(f, &DVector::zeros(2), &HessianOptions::default()).unwrap();
        assert!(result.corrected);
        assert_eq!(result.clipped, 1);
        assert!(nalgebra::Cholesky::new(result.positive_definite.clone()).is_some());
        let rebuilt = &result.factor * result.factor.transpose();
        assert_relative_eq!(rebuilt, result.covariance, epsilon = 1e-6);
    }

    #[test]
    fn infinite_objective_is_reported() {
        let f = |x: &DVector<f64>| Ok(if x[1] > 0.0 { f64::INFINITY } else { x[0] * x[0] });
        let result = estimate_hessian(f, &DVector::zeros(2), &HessianOptions::default());
        assert!(matches!(result, Err(DsgeError::HessianNotFinite { .. })));
    }
}
