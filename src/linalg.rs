//! Small dense linear-algebra helpers shared by the filter, Hessian, and sampler.

use nalgebra::{DMatrix, Dyn, SymmetricEigen};

/// Returns `(m + mᵀ) / 2`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Solves the discrete Lyapunov equation `P = T P Tᵀ + V` by doubling.
///
/// Returns `None` when the iteration does not settle, which happens exactly when `T`
/// has a root on or outside the unit circle.
pub fn discrete_lyapunov(
    t: &DMatrix<f64>,
    v: &DMatrix<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Option<DMatrix<f64>> {
    let mut a = t.clone();
    let mut p = symmetrize(v);
    for _ in 0..max_iterations {
        let increment = &a * &p * a.transpose();
        let next = symmetrize(&(&p + &increment));
        if !next.iter().all(|x| x.is_finite()) {
            return None;
        }
        let change = increment.amax();
        p = next;
        if change <= tolerance * p.amax().max(1.0) {
            return Some(p);
        }
        a = &a * &a;
    }
    None
}

/// Factor `L` with `L Lᵀ = m` for a symmetric positive semi-definite `m`.
///
/// Small negative eigenvalues produced by rounding are treated as zero.
pub fn psd_factor(m: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(symmetrize(m));
    let mut factor = eigen.eigenvectors;
    for (j, &lambda) in eigen.eigenvalues.iter().enumerate() {
        let root = lambda.max(0.0).sqrt();
        factor.column_mut(j).scale_mut(root);
    }
    factor
}

/// Nearest symmetric matrix with all eigenvalues at least `floor`.
///
/// Returns the corrected matrix, its eigen-decomposition, and the number of
/// eigenvalues that had to be raised.
pub fn clip_eigenvalues(
    m: &DMatrix<f64>,
    floor: f64,
) -> (DMatrix<f64>, SymmetricEigen<f64, Dyn>, usize) {
    let mut eigen = SymmetricEigen::new(symmetrize(m));
    let mut clipped = 0usize;
    for lambda in eigen.eigenvalues.iter_mut() {
        if !(*lambda >= floor) {
            *lambda = floor;
            clipped += 1;
        }
    }
    let corrected = symmetrize(&eigen.recompose());
    (corrected, eigen, clipped)
}
