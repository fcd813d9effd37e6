//! Small dense helpers shared by the filter and the smoother.

use nalgebra::{DMatrix, DMatrixView};

/// Relative diagonal jitter used when probing positive-definiteness.
pub const JITTER: f64 = 1e-10;

/// Replace `m` with (m + m') / 2.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = v;
            m[(j, i)] = v;
        }
    }
}

/// Factor L with LL' = m, clamping negative eigenvalues to zero.
pub fn psd_factor(m: DMatrixView<'_, f64>) -> DMatrix<f64> {
    let n = m.nrows();
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }
    if let Some(chol) = m.clone_owned().cholesky() {
        return chol.l();
    }
    let mut sym = m.clone_owned();
    symmetrize(&mut sym);
    let eig = sym.symmetric_eigen();
    let mut l = eig.eigenvectors;
    for (j, lambda) in eig.eigenvalues.iter().enumerate() {
        let s = lambda.max(0.0).sqrt();
        l.column_mut(j).scale_mut(s);
    }
    l
}

/// Lower triangular L (n x n) with LL' = AA' for A (n x m), m >= n,
/// from the QR decomposition of A'.
pub fn tria(a: DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let r = a.transpose().qr().r();
    let mut l = DMatrix::zeros(n, n);
    let rows = r.nrows().min(n);
    for i in 0..rows {
        for j in i..n {
            l[(j, i)] = r[(i, j)];
        }
    }
    l
}

/// True when `m` (plus a small relative jitter) admits a Cholesky factor.
pub fn is_positive_semidefinite(m: &DMatrix<f64>) -> bool {
    let n = m.nrows();
    if n == 0 {
        return true;
    }
    let scale = (0..n).map(|i| m[(i, i)].abs()).fold(0.0_f64, f64::max);
    if !scale.is_finite() {
        return false;
    }
    let jitter = JITTER * scale.max(f64::MIN_POSITIVE);
    let mut probe = m.clone();
    for i in 0..n {
        probe[(i, i)] += jitter;
    }
    probe.cholesky().is_some()
}

/// Largest absolute entry.
pub fn max_abs(m: &DMatrix<f64>) -> f64 {
    m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_symmetrize() {
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        symmetrize(&mut m);
        assert_eq!(m[(0, 1)], 3.0);
        assert_eq!(m[(1, 0)], 3.0);
    }

    #[test]
    fn test_psd_factor_singular() {
        // rank one: v v' with v = [1, 2]
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let l = psd_factor(m.as_view());
        let back = &l * l.transpose();
        assert_relative_eq!(back, m, epsilon = 1e-10);
    }

    #[test]
    fn test_tria_reproduces_product() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 0.5, -1.0, 0.3, 2.0]);
        let l = tria(a.clone());
        assert_eq!(l[(0, 1)], 0.0);
        assert_relative_eq!(&l * l.transpose(), &a * a.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_positive_semidefinite_probe() {
        let good = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(is_positive_semidefinite(&good));
        let bad = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -0.1]);
        assert!(!is_positive_semidefinite(&bad));
        assert!(is_positive_semidefinite(&DMatrix::zeros(3, 3)));
    }
}
