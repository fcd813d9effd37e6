//! The contract every block of state dynamics satisfies.
//!
//! Matrix arguments are views into larger matrices owned by the caller.
//! They are zero on entry and a component only writes its non-zero entries.

use std::fmt;

use nalgebra::{DMatrix, DMatrixViewMut, DVector};

use crate::linalg::psd_factor;

pub trait StateComponent: Send + Sync + fmt::Debug {
    /// Short label used in logs and diagnostics.
    fn name(&self) -> &str;

    fn dim(&self) -> usize;

    /// Number of initial state dimensions with unknown (infinite) variance.
    fn diffuse_dim(&self) -> usize {
        0
    }

    /// Initial mean; zero unless overridden.
    fn initial_state(&self, _a0: &mut [f64]) {}

    /// Finite part `pf0` and diffuse indicator `pi0` of the initial covariance.
    fn initial_covariance(&self, pf0: DMatrixViewMut<'_, f64>, pi0: DMatrixViewMut<'_, f64>);

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn transition(&self, t: usize, tm: DMatrixViewMut<'_, f64>);

    /// x <- T(t) x
    fn apply_transition(&self, t: usize, x: &mut [f64]);

    /// x <- T(t)' x
    fn apply_transposed_transition(&self, t: usize, x: &mut [f64]) {
        let n = self.dim();
        let mut tm = DMatrix::zeros(n, n);
        self.transition(t, tm.view_mut((0, 0), (n, n)));
        let y = tm.transpose() * DVector::from_column_slice(x);
        x.copy_from_slice(y.as_slice());
    }

    fn has_innovation(&self, _t: usize) -> bool {
        true
    }

    fn innovation_covariance(&self, t: usize, v: DMatrixViewMut<'_, f64>);

    /// Factor S with SS' = V(t).
    fn innovation_factor(&self, t: usize, mut s: DMatrixViewMut<'_, f64>) {
        let n = self.dim();
        let mut v = DMatrix::zeros(n, n);
        self.innovation_covariance(t, v.view_mut((0, 0), (n, n)));
        s.copy_from(&psd_factor(v.as_view()));
    }

    /// Measurement row Z(t).
    fn loading(&self, t: usize, z: &mut [f64]);

    /// Z(t) x
    fn zx(&self, t: usize, x: &[f64]) -> f64 {
        let mut z = vec![0.0; self.dim()];
        self.loading(t, &mut z);
        z.iter().zip(x).map(|(a, b)| a * b).sum()
    }

    /// Variance of the measurement noise added by this component.
    fn measurement_variance(&self, _t: usize) -> f64 {
        0.0
    }
}

/// Dense T(t) of a component.
pub fn transition_matrix(c: &dyn StateComponent, t: usize) -> DMatrix<f64> {
    let n = c.dim();
    let mut tm = DMatrix::zeros(n, n);
    c.transition(t, tm.view_mut((0, 0), (n, n)));
    tm
}

/// Dense V(t) of a component.
pub fn innovation_matrix(c: &dyn StateComponent, t: usize) -> DMatrix<f64> {
    let n = c.dim();
    let mut v = DMatrix::zeros(n, n);
    if c.has_innovation(t) {
        c.innovation_covariance(t, v.view_mut((0, 0), (n, n)));
    }
    v
}

/// Z(t) of a component as a vector.
pub fn loading_vector(c: &dyn StateComponent, t: usize) -> DVector<f64> {
    let mut z = DVector::zeros(c.dim());
    c.loading(t, z.as_mut_slice());
    z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{LocalLinearTrend, Seasonal, SeasonalModel};
    use approx::assert_relative_eq;

    #[test]
    fn test_default_transposed_transition_matches_matrix() {
        let c = Seasonal::new(SeasonalModel::Trigonometric, 4, 1.0).unwrap();
        let tm = transition_matrix(&c, 0);
        let x = [0.3, -1.0, 2.0];
        let mut y = x;
        c.apply_transposed_transition(0, &mut y);
        let expected = tm.transpose() * DVector::from_column_slice(&x);
        for i in 0..3 {
            assert_relative_eq!(y[i], expected[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_default_factor_reproduces_covariance() {
        let c = LocalLinearTrend::new(2.0, 0.5);
        let mut s = DMatrix::zeros(2, 2);
        c.innovation_factor(0, s.view_mut((0, 0), (2, 2)));
        assert_relative_eq!(&s * s.transpose(), innovation_matrix(&c, 0), epsilon = 1e-12);
    }

    #[test]
    fn test_helpers_dimensions() {
        let c = LocalLinearTrend::new(1.0, 1.0);
        assert_eq!(transition_matrix(&c, 0).shape(), (2, 2));
        assert_eq!(loading_vector(&c, 0).as_slice(), &[1.0, 0.0]);
    }
}
