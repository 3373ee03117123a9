//! Sims' gensys: solving linear rational-expectations models.
//!
//! The input is the canonical form
//!
//! ```text
//! Γ0 x_t = Γ1 x_{t-1} + C + Ψ ε_t + Π η_t
//! ```
//!
//! where `ε` are exogenous shocks and `η` expectational errors. When a unique
//! stable solution exists it is returned as the transition law
//! `x_t = T x_{t-1} + R ε_t + C`.

use log::debug;
use nalgebra::{Complex, DMatrix, DVector, Normed};
use serde::{Deserialize, Serialize};

use crate::error::{DsgeError, Result};
use crate::options::SolverOptions;
use crate::qz::QzDecomposition;

type C64 = Complex<f64>;

/// Canonical-form matrices of a linearized model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumSystem {
    pub gamma0: DMatrix<f64>,
    pub gamma1: DMatrix<f64>,
    pub constant: DVector<f64>,
    pub psi: DMatrix<f64>,
    pub pi: DMatrix<f64>,
}

impl EquilibriumSystem {
    /// Builds a system with a zero constant, validating shapes.
    pub fn new(
        gamma0: DMatrix<f64>,
        gamma1: DMatrix<f64>,
        psi: DMatrix<f64>,
        pi: DMatrix<f64>,
    ) -> Result<Self> {
        let n = gamma0.nrows();
        Self::with_constant(gamma0, gamma1, DVector::zeros(n), psi, pi)
    }

    /// Builds a system with an explicit constant vector.
    pub fn with_constant(
        gamma0: DMatrix<f64>,
        gamma1: DMatrix<f64>,
        constant: DVector<f64>,
        psi: DMatrix<f64>,
        pi: DMatrix<f64>,
    ) -> Result<Self> {
        let n = gamma0.nrows();
        if gamma0.ncols() != n {
            return Err(DsgeError::dimension_mismatch("Γ0 columns", n, gamma0.ncols()));
        }
        if gamma1.nrows() != n || gamma1.ncols() != n {
            return Err(DsgeError::dimension_mismatch("Γ1 rows", n, gamma1.nrows()));
        }
        if constant.len() != n {
            return Err(DsgeError::dimension_mismatch("constant length", n, constant.len()));
        }
        if psi.nrows() != n {
            return Err(DsgeError::dimension_mismatch("Ψ rows", n, psi.nrows()));
        }
        if pi.nrows() != n {
            return Err(DsgeError::dimension_mismatch("Π rows", n, pi.nrows()));
        }
        Ok(Self {
            gamma0,
            gamma1,
            constant,
            psi,
            pi,
        })
    }

    pub fn state_count(&self) -> usize {
        self.gamma0.nrows()
    }

    pub fn shock_count(&self) -> usize {
        self.psi.ncols()
    }

    pub fn expectational_error_count(&self) -> usize {
        self.pi.ncols()
    }
}

/// Solved law of motion `x_t = T x_{t-1} + R ε_t + C`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub ttt: DMatrix<f64>,
    pub rrr: DMatrix<f64>,
    pub ccc: DVector<f64>,
}

impl Transition {
    /// Checks that `T` is square and that `R` and `C` share its rows.
    pub fn new(ttt: DMatrix<f64>, rrr: DMatrix<f64>, ccc: DVector<f64>) -> Result<Self> {
        let n = ttt.nrows();
        if ttt.ncols() != n {
            return Err(DsgeError::dimension_mismatch("T columns", n, ttt.ncols()));
        }
        if rrr.nrows() != n {
            return Err(DsgeError::dimension_mismatch("R rows", n, rrr.nrows()));
        }
        if ccc.len() != n {
            return Err(DsgeError::dimension_mismatch("C length", n, ccc.len()));
        }
        Ok(Self { ttt, rrr, ccc })
    }

    pub fn state_count(&self) -> usize {
        self.ttt.nrows()
    }

    pub fn shock_count(&self) -> usize {
        self.rrr.ncols()
    }
}

/// Solves the canonical-form system.
///
/// Fails with [`DsgeError::NoStableSolution`] when the unstable block cannot be
/// annihilated by the expectational errors, [`DsgeError::Indeterminacy`] when the
/// stable solution is not unique, and [`DsgeError::CoincidentZeros`] or
/// [`DsgeError::QzFailure`] on numerical degeneracy.
pub fn solve(system: &EquilibriumSystem, options: &SolverOptions) -> Result<Transition> {
    let n = system.state_count();
    let neta = system.expectational_error_count();
    let nshocks = system.shock_count();
    if !(options.div >= 1.0) {
        return Err(DsgeError::invalid_option("div", "must be at least one"));
    }

    let mut qz = QzDecomposition::new(&system.gamma0, &system.gamma1)?;

    let pairs = qz.eigen_pairs();
    for (position, (s, t)) in pairs.iter().enumerate() {
        if s.norm() < options.coincident_zero_tol && t.norm() < options.coincident_zero_tol {
            return Err(DsgeError::CoincidentZeros { position });
        }
    }
    let select: Vec<bool> = pairs
        .iter()
        .map(|(s, t)| t.norm() < options.div * s.norm())
        .collect();
    let nunstab = select.iter().filter(|&&stable| !stable).count();
    let nstab = n - nunstab;
    qz.reorder(&select)?;
    debug!("gensys: {n} states, {nunstab} unstable roots, {neta} expectational errors");

    let pi = complexify(&system.pi);
    let q_adj = qz.q.adjoint();
    let q1_adj = q_adj.rows(0, nstab).into_owned();
    let q2_adj = q_adj.rows(nstab, nunstab).into_owned();

    let unstable = truncated_svd(&(&q2_adj * &pi), options.rank_tol);
    if unstable.rank() < nunstab {
        return Err(DsgeError::NoStableSolution {
            unstable: nunstab,
            spanned: unstable.rank(),
        });
    }

    let stable = truncated_svd(&(&q1_adj * &pi), options.rank_tol);
    if stable.rank() > 0 {
        let projector = &unstable.v * unstable.v.adjoint();
        let loose = &stable.v - projector * &stable.v;
        let loose_rank = truncated_svd(&loose, options.rank_tol * n as f64).rank();
        if loose_rank > 0 {
            return Err(DsgeError::Indeterminacy { loose: loose_rank });
        }
    }

    // tmat = [I, -(U_u D_u⁻¹ V_uᴴ V_s D_s U_sᴴ)ᴴ]
    let mut tmat = DMatrix::<C64>::zeros(nstab, n);
    tmat.view_mut((0, 0), (nstab, nstab))
        .copy_from(&DMatrix::identity(nstab, nstab));
    if nunstab > 0 {
        let mut u_scaled = unstable.u.clone();
        for (j, &sigma) in unstable.singular_values.iter().enumerate() {
            u_scaled.column_mut(j).unscale_mut(sigma);
        }
        let mut u_stable_scaled = stable.u.clone();
        for (j, &sigma) in stable.singular_values.iter().enumerate() {
            u_stable_scaled.column_mut(j).scale_mut(sigma);
        }
        let coupling = u_scaled
            * unstable.v.adjoint()
            * &stable.v
            * u_stable_scaled.adjoint();
        tmat.view_mut((0, nstab), (nstab, nunstab))
            .copy_from(&(-coupling.adjoint()));
    }

    let s = &qz.s;
    let t = &qz.t;
    let mut g0 = DMatrix::<C64>::zeros(n, n);
    g0.view_mut((0, 0), (nstab, n)).copy_from(&(&tmat * s));
    g0.view_mut((nstab, nstab), (nunstab, nunstab))
        .copy_from(&DMatrix::identity(nunstab, nunstab));
    let mut g1 = DMatrix::<C64>::zeros(n, n);
    g1.view_mut((0, 0), (nstab, n)).copy_from(&(&tmat * t));

    let g0_inv = g0
        .try_inverse()
        .ok_or_else(|| DsgeError::singular("gensys G0"))?;

    let constant = complexify_vector(&system.constant);
    let mut c_block = DMatrix::<C64>::zeros(n, 1);
    c_block
        .view_mut((0, 0), (nstab, 1))
        .copy_from(&(&tmat * &q_adj * &constant));
    if nunstab > 0 && system.constant.iter().any(|&c| c != 0.0) {
        let ausix = s.view((nstab, nstab), (nunstab, nunstab)).into_owned();
        let busix = t.view((nstab, nstab), (nunstab, nunstab)).into_owned();
        let rhs = &q2_adj * &constant;
        let solved = (ausix - busix)
            .lu()
            .solve(&rhs)
            .ok_or_else(|| DsgeError::singular("gensys unstable constant block"))?;
        c_block.view_mut((nstab, 0), (nunstab, 1)).copy_from(&solved);
    }

    let psi = complexify(&system.psi);
    let mut impact = DMatrix::<C64>::zeros(n, nshocks);
    impact
        .view_mut((0, 0), (nstab, nshocks))
        .copy_from(&(&tmat * &q_adj * &psi));

    let z = &qz.z;
    let ttt = (z * (&g0_inv * g1) * z.adjoint()).map(|v| v.re);
    let ccc = (z * (&g0_inv * c_block)).map(|v| v.re);
    let rrr = (z * (&g0_inv * impact)).map(|v| v.re);

    if ttt.iter().chain(rrr.iter()).chain(ccc.iter()).any(|v| !v.is_finite()) {
        return Err(DsgeError::NumericalError {
            context: "gensys solution",
        });
    }

    Transition::new(ttt, rrr, ccc.column(0).into_owned())
}

/// Singular vectors belonging to singular values above a tolerance.
struct TruncatedSvd {
    u: DMatrix<C64>,
    singular_values: Vec<f64>,
    v: DMatrix<C64>,
}

impl TruncatedSvd {
    fn rank(&self) -> usize {
        self.singular_values.len()
    }
}

fn truncated_svd(m: &DMatrix<C64>, tolerance: f64) -> TruncatedSvd {
    let (rows, cols) = m.shape();
    if rows == 0 || cols == 0 {
        return TruncatedSvd {
            u: DMatrix::zeros(rows, 0),
            singular_values: Vec::new(),
            v: DMatrix::zeros(cols, 0),
        };
    }
    let svd = m.clone().svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => unreachable!("singular vectors were requested"),
    };
    let kept: Vec<usize> = svd
        .singular_values
        .iter()
        .enumerate()
        .filter(|(_, &sigma)| sigma > tolerance)
        .map(|(j, _)| j)
        .collect();
    let v = v_t.adjoint();
    TruncatedSvd {
        u: u.select_columns(kept.iter()),
        singular_values: kept.iter().map(|&j| svd.singular_values[j]).collect(),
        v: v.select_columns(kept.iter()),
    }
}

fn complexify(m: &DMatrix<f64>) -> DMatrix<C64> {
    m.map(|v| C64::new(v, 0.0))
}

fn complexify_vector(v: &DVector<f64>) -> DMatrix<C64> {
    DMatrix::from_iterator(v.len(), 1, v.iter().map(|&x| C64::new(x, 0.0)))
}
