//! Linear algebra helpers for covariance factors, SPD solves and Gaussian densities.
//!
//! Public API:
//!     pub fn symmetrize(m) -> DMatrix
//!     pub fn cholesky_factor(p) -> Result<DMatrix>
//!     pub fn chol_solve_spd(a, b, opt) -> Option<DMatrix>
//!     pub fn robust_spd_solve(a, b) -> Result<DMatrix>
//!     pub fn gaussian_log_density(x, mean, cov) -> Result<f64>
//!     pub fn matvec_last_axis(m, x) -> Result<ArrayD>
//!
//! Strategy for factoring a covariance P:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{ArrayD, IxDyn};

use crate::error::{FilterError, Result};

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Cholesky of the symmetrized matrix, retrying with a growing diagonal jitter.
fn jittered_cholesky(p: &DMatrix<f64>, opt: SolveOptions) -> Option<Cholesky<f64, nalgebra::Dyn>> {
    let p = symmetrize(p);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some(ch);
    }
    let n = p.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch);
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

fn check_square(m: &DMatrix<f64>, what: &str) -> Result<()> {
    if m.is_square() {
        Ok(())
    } else {
        Err(FilterError::ShapeMismatch(format!(
            "{what} must be square, found {}x{}",
            m.nrows(),
            m.ncols()
        )))
    }
}

/// Lower-triangular L with P ≈ L Lᵀ.
///
/// # Example
/// ```rust
/// use nalgebra::dmatrix;
/// use smc::linalg::cholesky_factor;
///
/// let p = dmatrix![4.0, 2.0; 2.0, 3.0];
/// let l = cholesky_factor(&p).unwrap();
/// assert!((&l * l.transpose() - p).abs().max() < 1e-12);
/// ```
pub fn cholesky_factor(p: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    check_square(p, "covariance")?;
    jittered_cholesky(p, SolveOptions::default())
        .map(|ch| ch.l())
        .ok_or_else(|| {
            FilterError::InvalidParameter("covariance is not positive definite".to_string())
        })
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail.
pub fn chol_solve_spd(a: &DMatrix<f64>, b: &DMatrix<f64>, opt: SolveOptions) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    jittered_cholesky(a, opt).map(|ch| ch.solve(b))
}

/// Robust SPD solve:
/// - Cholesky + jitter (preferred)
/// - Last resort: explicit inverse
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    check_square(a, "system matrix")?;
    if a.nrows() != b.nrows() {
        return Err(FilterError::ShapeMismatch(format!(
            "cannot solve a {}x{} system against {} rows",
            a.nrows(),
            a.ncols(),
            b.nrows()
        )));
    }
    if let Some(x) = chol_solve_spd(a, b, SolveOptions::default()) {
        Ok(x)
    } else if let Some(inv) = symmetrize(a).try_inverse() {
        Ok(&inv * b)
    } else {
        Err(FilterError::InvalidParameter(
            "matrix is not invertible, even after jitter".to_string(),
        ))
    }
}

/// log N(x; mean, cov)
pub fn gaussian_log_density(x: &DVector<f64>, mean: &DVector<f64>, cov: &DMatrix<f64>) -> Result<f64> {
    let l = cholesky_factor(cov)?;
    if x.len() != l.nrows() || mean.len() != l.nrows() {
        return Err(FilterError::ShapeMismatch(format!(
            "vector of length {} against a {}x{} covariance",
            x.len(),
            l.nrows(),
            l.ncols()
        )));
    }
    let whitened = l
        .solve_lower_triangular(&(x - mean))
        .ok_or_else(|| FilterError::InvalidParameter("singular covariance factor".to_string()))?;
    let log_det: f64 = l.diagonal().iter().map(|d| d.ln()).sum();
    let dim = x.len() as f64;
    Ok(-0.5 * whitened.norm_squared() - log_det - 0.5 * dim * (2.0 * std::f64::consts::PI).ln())
}

/// Apply `m` to every vector stored along the last axis of `x`.
pub fn matvec_last_axis(m: &DMatrix<f64>, x: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let cols = m.ncols();
    if x.shape().last() != Some(&cols) {
        return Err(FilterError::ShapeMismatch(format!(
            "cannot apply a {}x{cols} matrix to vectors of shape {:?}",
            m.nrows(),
            x.shape()
        )));
    }
    let flat: Vec<f64> = x.iter().copied().collect();
    let mut out = Vec::with_capacity(flat.len() / cols.max(1) * m.nrows());
    for row in flat.chunks(cols) {
        out.extend((m * DVector::from_column_slice(row)).iter());
    }
    let mut shape = x.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = m.nrows();
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{dmatrix, dvector};

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        a.shape() == b.shape() && (a - b).abs().max() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&symmetrize(&m), &s_expected, 1e-15));
    }

    #[test]
    fn t_cholesky_with_jitter() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.2, 0.0, 0.0, 1.0, 0.2, 0.0, 0.0, 1.0]);
        let mut p = &a * a.transpose();
        p[(2, 2)] -= 1e-10;
        let l = cholesky_factor(&p).unwrap();
        assert!(approx_eq(&(&l * l.transpose()), &symmetrize(&p), 1e-8));
        assert!(cholesky_factor(&dmatrix![1.0, 0.0; 0.0, -1.0]).is_err());
        assert!(cholesky_factor(&DMatrix::zeros(2, 3)).is_err());
    }

    #[test]
    fn t_robust_spd_solve() {
        let a = dmatrix![4.0, 1.0; 1.0, 3.0];
        let b = dmatrix![1.0; 2.0];
        let x = robust_spd_solve(&a, &b).unwrap();
        assert!(approx_eq(&(&a * &x), &b, 1e-12));
        assert!(robust_spd_solve(&a, &dmatrix![1.0; 2.0; 3.0]).is_err());
    }

    #[test]
    fn t_gaussian_log_density_diagonal() {
        let x = dvector![1.0, -1.0];
        let mean = dvector![0.0, 0.0];
        let cov = dmatrix![1.0, 0.0; 0.0, 4.0];
        let expected = -0.5 * (1.0 + 0.25) - 2.0_f64.ln() - (2.0 * std::f64::consts::PI).ln();
        assert_approx_eq!(gaussian_log_density(&x, &mean, &cov).unwrap(), expected, 1e-12);
    }

    #[test]
    fn t_matvec_last_axis() {
        let m = dmatrix![1.0, 2.0; 0.0, 1.0; 1.0, 1.0];
        let x = ndarray::array![[1.0, 1.0], [2.0, -1.0]].into_dyn();
        let y = matvec_last_axis(&m, &x).unwrap();
        assert_eq!(y, ndarray::array![[3.0, 1.0, 2.0], [0.0, -1.0, 1.0]].into_dyn());
    }
}
