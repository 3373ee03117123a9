//! Complex generalized Schur (QZ) decomposition with eigenvalue reordering.
//!
//! For a square pair `(A, B)` this computes unitary `Q`, `Z` and upper triangular
//! `S`, `T` with `Qᴴ A Z = S` and `Qᴴ B Z = T`. The generalized eigenvalues of the
//! pencil are the ratios `T_ii / S_ii`, which is the orientation gensys uses
//! (`A = Γ0`, `B = Γ1`).
//!
//! The iteration runs on the pencil `(B, A)`: `A` is reduced to triangular form
//! first and `B` to Hessenberg form, then single-shift complex QZ sweeps drive
//! `B` to triangular form. Zeros on the diagonal of `A` (infinite roots) are
//! chased out of the active block before sweeping.

use nalgebra::{Complex, ComplexField, DMatrix, Normed};

use crate::error::{DsgeError, Result};

type C64 = Complex<f64>;

const MAX_SWEEPS_PER_ROOT: usize = 60;

/// Generalized Schur form of a matrix pair.
#[derive(Clone, Debug)]
pub struct QzDecomposition {
    /// Triangular factor of the first matrix (`Qᴴ A Z`).
    pub s: DMatrix<C64>,
    /// Triangular factor of the second matrix (`Qᴴ B Z`).
    pub t: DMatrix<C64>,
    /// Left unitary factor.
    pub q: DMatrix<C64>,
    /// Right unitary factor.
    pub z: DMatrix<C64>,
}

impl QzDecomposition {
    /// Decomposes the pair `(a, b)`.
    pub fn new(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<Self> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(DsgeError::dimension_mismatch("QZ first matrix columns", n, a.ncols()));
        }
        if b.nrows() != n || b.ncols() != n {
            return Err(DsgeError::dimension_mismatch("QZ second matrix", n, b.nrows()));
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(DsgeError::NumericalError {
                context: "QZ input",
            });
        }

        let mut decomposition = Self {
            s: a.map(|v| C64::new(v, 0.0)),
            t: b.map(|v| C64::new(v, 0.0)),
            q: DMatrix::identity(n, n),
            z: DMatrix::identity(n, n),
        };
        decomposition.reduce_to_hessenberg_triangular();
        decomposition.iterate()?;
        Ok(decomposition)
    }

    pub fn dim(&self) -> usize {
        self.s.nrows()
    }

    /// Diagonal pairs `(S_ii, T_ii)`; the generalized eigenvalues are `T_ii / S_ii`.
    pub fn eigen_pairs(&self) -> Vec<(C64, C64)> {
        (0..self.dim())
            .map(|i| (self.s[(i, i)], self.t[(i, i)]))
            .collect()
    }

    /// Reorders the decomposition so that the positions flagged in `select` come first,
    /// preserving the relative order within each group.
    pub fn reorder(&mut self, select: &[bool]) -> Result<()> {
        let n = self.dim();
        if select.len() != n {
            return Err(DsgeError::dimension_mismatch("QZ selection", n, select.len()));
        }
        let mut flags = select.to_vec();
        let mut target = 0usize;
        for position in 0..n {
            if !flags[position] {
                continue;
            }
            let mut current = position;
            while current > target {
                self.swap_adjacent(current - 1)?;
                flags.swap(current - 1, current);
                current -= 1;
            }
            target += 1;
        }
        Ok(())
    }

    /// Reduces `S` to upper triangular and `T` to upper Hessenberg form.
    fn reduce_to_hessenberg_triangular(&mut self) {
        let n = self.dim();
        for col in 0..n.saturating_sub(1) {
            for row in (col + 1..n).rev() {
                let (c, s) = givens(self.s[(row - 1, col)], self.s[(row, col)]);
                self.rotate_rows(row - 1, row, c, s);
                self.s[(row, col)] = C64::new(0.0, 0.0);
            }
        }
        for col in 0..n.saturating_sub(2) {
            for row in (col + 2..n).rev() {
                let (c, s) = givens(self.t[(row - 1, col)], self.t[(row, col)]);
                self.rotate_rows(row - 1, row, c, s);
                self.t[(row, col)] = C64::new(0.0, 0.0);

                let (c, s) = givens(self.s[(row, row)], self.s[(row, row - 1)]);
                self.rotate_cols(row, row - 1, c, s);
                self.s[(row, row - 1)] = C64::new(0.0, 0.0);
            }
        }
    }

    /// Single-shift QZ sweeps on the Hessenberg factor `T` with triangular `S`.
    fn iterate(&mut self) -> Result<()> {
        let n = self.dim();
        if n < 2 {
            return Ok(());
        }
        let t_norm = self.t.norm().max(f64::MIN_POSITIVE);
        let s_norm = self.s.norm().max(f64::MIN_POSITIVE);
        let t_tol = f64::EPSILON * t_norm;
        let s_tol = f64::EPSILON * s_norm;

        let mut ihi = n - 1;
        let mut sweeps = 0usize;
        let mut total = 0usize;
        while ihi > 0 {
            let mut ilo = ihi;
            while ilo > 0 {
                let sub = self.t[(ilo, ilo - 1)].norm();
                let local = self.t[(ilo, ilo)].norm() + self.t[(ilo - 1, ilo - 1)].norm();
                if sub <= t_tol || sub <= f64::EPSILON * local {
                    self.t[(ilo, ilo - 1)] = C64::new(0.0, 0.0);
                    break;
                }
                ilo -= 1;
            }
            if ilo == ihi {
                ihi -= 1;
                sweeps = 0;
                continue;
            }

            if let Some(j) = (ilo..=ihi).find(|&j| self.s[(j, j)].norm() <= s_tol) {
                self.s[(j, j)] = C64::new(0.0, 0.0);
                self.deflate_infinite(j, ilo, ihi);
                continue;
            }

            sweeps += 1;
            total += 1;
            if sweeps > MAX_SWEEPS_PER_ROOT || total > MAX_SWEEPS_PER_ROOT * n {
                return Err(DsgeError::QzFailure {
                    reason: "QZ iteration did not converge",
                });
            }
            let shift = if sweeps % 10 == 0 {
                self.exceptional_shift(ihi)
            } else {
                self.wilkinson_shift(ihi)
            };
            self.sweep(ilo, ihi, shift);
        }
        Ok(())
    }

    /// Removes a zero at `S[j, j]` by splitting off an infinite root at the top or bottom
    /// of the active block `[ilo, ihi]`.
    fn deflate_infinite(&mut self, j: usize, ilo: usize, ihi: usize) {
        let zero = C64::new(0.0, 0.0);
        if j == ilo {
            let (c, s) = givens(self.t[(ilo, ilo)], self.t[(ilo + 1, ilo)]);
            self.rotate_rows(ilo, ilo + 1, c, s);
            self.t[(ilo + 1, ilo)] = zero;
            self.s[(ilo + 1, ilo)] = zero;
            return;
        }
        for k in j..ihi {
            let (c, s) = givens(self.s[(k, k + 1)], self.s[(k + 1, k + 1)]);
            self.rotate_rows(k, k + 1, c, s);
            self.s[(k + 1, k + 1)] = zero;
            self.s[(k + 1, k)] = zero;

            let (c, s) = givens(self.t[(k + 1, k)], self.t[(k + 1, k - 1)]);
            self.rotate_cols(k, k - 1, c, s);
            self.t[(k + 1, k - 1)] = zero;
            self.s[(k, k - 1)] = zero;
        }
        let (c, s) = givens(self.t[(ihi, ihi)], self.t[(ihi, ihi - 1)]);
        self.rotate_cols(ihi, ihi - 1, c, s);
        self.t[(ihi, ihi - 1)] = zero;
        self.s[(ihi, ihi - 1)] = zero;
    }

    /// Root of the trailing 2×2 pencil closest to the trailing diagonal ratio.
    fn wilkinson_shift(&self, ihi: usize) -> C64 {
        let (h11, h12) = (self.t[(ihi - 1, ihi - 1)], self.t[(ihi - 1, ihi)]);
        let (h21, h22) = (self.t[(ihi, ihi - 1)], self.t[(ihi, ihi)]);
        let (t11, t12, t22) = (
            self.s[(ihi - 1, ihi - 1)],
            self.s[(ihi - 1, ihi)],
            self.s[(ihi, ihi)],
        );
        let anchor = h22 / t22;

        let a = t11 * t22;
        let b = -(h11 * t22 + h22 * t11 - t12 * h21);
        let c = h11 * h22 - h12 * h21;
        let disc = (b * b - a * c * 4.0).sqrt();
        let sign = if (b.conj() * disc).re >= 0.0 { 1.0 } else { -1.0 };
        let q = -(b + disc * sign) * 0.5;
        if q.norm() == 0.0 {
            return anchor;
        }
        let roots = [q / a, c / q];
        let closest = if (roots[0] - anchor).norm() <= (roots[1] - anchor).norm() {
            roots[0]
        } else {
            roots[1]
        };
        if closest.re.is_finite() && closest.im.is_finite() {
            closest
        } else {
            anchor
        }
    }

    fn exceptional_shift(&self, ihi: usize) -> C64 {
        let ratio = self.t[(ihi, ihi)] / self.s[(ihi, ihi)];
        ratio + self.t[(ihi, ihi - 1)].norm() / self.s[(ihi - 1, ihi - 1)].norm()
    }

    /// One implicit single-shift QZ sweep over the active block.
    fn sweep(&mut self, ilo: usize, ihi: usize, shift: C64) {
        let zero = C64::new(0.0, 0.0);
        for k in ilo..ihi {
            let (c, s) = if k == ilo {
                givens(
                    self.t[(ilo, ilo)] - shift * self.s[(ilo, ilo)],
                    self.t[(ilo + 1, ilo)],
                )
            } else {
                givens(self.t[(k, k - 1)], self.t[(k + 1, k - 1)])
            };
            self.rotate_rows(k, k + 1, c, s);
            if k > ilo {
                self.t[(k + 1, k - 1)] = zero;
            }

            let (c, s) = givens(self.s[(k + 1, k + 1)], self.s[(k + 1, k)]);
            self.rotate_cols(k + 1, k, c, s);
            self.s[(k + 1, k)] = zero;
        }
    }

    /// Swaps the diagonal pairs at positions `j` and `j + 1`.
    fn swap_adjacent(&mut self, j: usize) -> Result<()> {
        let zero = C64::new(0.0, 0.0);
        let (a11, a12, a22) = (self.s[(j, j)], self.s[(j, j + 1)], self.s[(j + 1, j + 1)]);
        let (b11, b12, b22) = (self.t[(j, j)], self.t[(j, j + 1)], self.t[(j + 1, j + 1)]);

        // Right eigenvector of the lower root, (G, -F), rotated into the leading column.
        let f = a22 * b11 - b22 * a11;
        let g = a22 * b12 - b22 * a12;
        let norm = (f.norm_sqr() + g.norm_sqr()).sqrt();
        if norm == 0.0 {
            return Ok(());
        }
        let (cz, sz) = if g.norm() == 0.0 {
            (0.0, C64::new(1.0, 0.0))
        } else {
            (g.norm() / norm, -f * g.conj() / (g.norm() * norm))
        };
        self.rotate_cols(j, j + 1, cz, sz);

        let use_s = self.s[(j, j)].norm() + self.s[(j + 1, j)].norm()
            >= self.t[(j, j)].norm() + self.t[(j + 1, j)].norm();
        let (c, s) = if use_s {
            givens(self.s[(j, j)], self.s[(j + 1, j)])
        } else {
            givens(self.t[(j, j)], self.t[(j + 1, j)])
        };
        self.rotate_rows(j, j + 1, c, s);

        let scale = self.s.norm() + self.t.norm();
        let residual = self.s[(j + 1, j)].norm() + self.t[(j + 1, j)].norm();
        if residual > f64::EPSILON.sqrt() * scale {
            return Err(DsgeError::QzFailure {
                reason: "eigenvalue swap is ill-conditioned",
            });
        }
        self.s[(j + 1, j)] = zero;
        self.t[(j + 1, j)] = zero;
        Ok(())
    }

    /// Applies `[c s; -s̄ c]` to rows `i` and `k` of both factors and accumulates `Q`.
    fn rotate_rows(&mut self, i: usize, k: usize, c: f64, s: C64) {
        rotate_row_pair(&mut self.s, i, k, c, s);
        rotate_row_pair(&mut self.t, i, k, c, s);
        rotate_col_pair(&mut self.q, i, k, c, s.conj());
    }

    /// Replaces columns `i`, `k` by `c·col_i + s·col_k` and `c·col_k − s̄·col_i`, accumulating `Z`.
    fn rotate_cols(&mut self, i: usize, k: usize, c: f64, s: C64) {
        rotate_col_pair(&mut self.s, i, k, c, s);
        rotate_col_pair(&mut self.t, i, k, c, s);
        rotate_col_pair(&mut self.z, i, k, c, s);
    }
}

/// Complex Givens rotation: `c·f + s·g = r` and `−s̄·f + c·g = 0` with `c` real.
fn givens(f: C64, g: C64) -> (f64, C64) {
    let g_norm = g.norm();
    if g_norm == 0.0 {
        return (1.0, C64::new(0.0, 0.0));
    }
    let f_norm = f.norm();
    if f_norm == 0.0 {
        return (0.0, g.conj() / g_norm);
    }
    let norm = (f_norm * f_norm + g_norm * g_norm).sqrt();
    (f_norm / norm, (f / f_norm) * g.conj() / norm)
}

fn rotate_row_pair(m: &mut DMatrix<C64>, i: usize, k: usize, c: f64, s: C64) {
    for col in 0..m.ncols() {
        let x = m[(i, col)];
        let y = m[(k, col)];
        m[(i, col)] = x * c + s * y;
        m[(k, col)] = y * c - s.conj() * x;
    }
}

fn rotate_col_pair(m: &mut DMatrix<C64>, i: usize, k: usize, c: f64, s: C64) {
    for row in 0..m.nrows() {
        let x = m[(row, i)];
        let y = m[(row, k)];
        m[(row, i)] = x * c + s * y;
        m[(row, k)] = y * c - s.conj() * x;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complexify(m: &DMatrix<f64>) -> DMatrix<C64> {
        m.map(|v| C64::new(v, 0.0))
    }

    fn assert_decomposes(qz: &QzDecomposition, a: &DMatrix<f64>, b: &DMatrix<f64>) {
        let n = a.nrows();
        let identity = DMatrix::<C64>::identity(n, n);
        assert!((qz.q.adjoint() * &qz.q - &identity).norm() < 1e-12);
        assert!((qz.z.adjoint() * &qz.z - &identity).norm() < 1e-12);
        assert!((&qz.q * &qz.s * qz.z.adjoint() - complexify(a)).norm() < 1e-10);
        assert!((&qz.q * &qz.t * qz.z.adjoint() - complexify(b)).norm() < 1e-10);
        for i in 0..n {
            for j in 0..i {
                assert!(qz.s[(i, j)].norm() < 1e-12, "S not triangular at ({i}, {j})");
                assert!(qz.t[(i, j)].norm() < 1e-12, "T not triangular at ({i}, {j})");
            }
        }
    }

    fn sample_pair() -> (DMatrix<f64>, DMatrix<f64>) {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, 1.0, 0.0, 0.5, //
                0.3, 1.5, -0.4, 0.0, //
                1.0, 0.0, 3.0, 0.2, //
                0.0, -0.7, 0.1, 1.0,
            ],
        );
        let b = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.4, -1.2, 0.3, 0.0, //
                1.1, 0.2, 0.0, 0.9, //
                0.0, 0.5, -0.6, 1.4, //
                0.8, 0.0, 0.7, 0.1,
            ],
        );
        (a, b)
    }

    #[test]
    fn decomposition_reproduces_the_pair() {
        let (a, b) = sample_pair();
        let qz = QzDecomposition::new(&a, &b).unwrap();
        assert_decomposes(&qz, &a, &b);
    }

    #[test]
    fn singular_first_matrix_yields_infinite_roots() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.5, 1.0, 1.0]);
        let b = DMatrix::from_row_slice(3, 3, &[0.5, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.3, 0.2]);
        let qz = QzDecomposition::new(&a, &b).unwrap();
        assert_decomposes(&qz, &a, &b);
        let infinite = qz
            .eigen_pairs()
            .iter()
            .filter(|(s, t)| s.norm() < 1e-10 && t.norm() > 1e-6)
            .count();
        assert_eq!(infinite, 1);
    }

    #[test]
    fn reorder_moves_selected_roots_first() {
        let (a, b) = sample_pair();
        let mut qz = QzDecomposition::new(&a, &b).unwrap();
        let moduli: Vec<f64> = qz
            .eigen_pairs()
            .iter()
            .map(|(s, t)| (t / s).norm())
            .collect();
        let select: Vec<bool> = moduli.iter().map(|&m| m < 1.0).collect();
        let stable = select.iter().filter(|&&flag| flag).count();

        qz.reorder(&select).unwrap();
        assert_decomposes(&qz, &a, &b);
        for (position, (s, t)) in qz.eigen_pairs().iter().enumerate() {
            assert_eq!((t / s).norm() < 1.0, position < stable);
        }
    }
}
