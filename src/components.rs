//! Structural building blocks: level, trend, seasonal, cycle, noise and
//! regression effects.

use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{DMatrix, DMatrixViewMut};
use serde::{Deserialize, Serialize};

use crate::component::StateComponent;
use crate::error::{Result, SsfError};

/// Random walk level. One diffuse dimension.
#[derive(Debug, Clone)]
pub struct LocalLevel {
    pub variance: f64,
}

impl LocalLevel {
    pub fn new(variance: f64) -> Self {
        Self { variance }
    }
}

impl StateComponent for LocalLevel {
    fn name(&self) -> &str {
        "level"
    }

    fn dim(&self) -> usize {
        1
    }

    fn diffuse_dim(&self) -> usize {
        1
    }

    fn initial_covariance(&self, _pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        pi0[(0, 0)] = 1.0;
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        tm[(0, 0)] = 1.0;
    }

    fn apply_transition(&self, _t: usize, _x: &mut [f64]) {}

    fn apply_transposed_transition(&self, _t: usize, _x: &mut [f64]) {}

    fn has_innovation(&self, _t: usize) -> bool {
        self.variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        v[(0, 0)] = self.variance;
    }

    fn innovation_factor(&self, _t: usize, mut s: DMatrixViewMut<'_, f64>) {
        s[(0, 0)] = self.variance.max(0.0).sqrt();
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        z[0] = 1.0;
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        x[0]
    }
}

/// Level plus slope: mu(t+1) = mu(t) + beta(t) + eta, beta(t+1) = beta(t) + zeta.
#[derive(Debug, Clone)]
pub struct LocalLinearTrend {
    pub level_variance: f64,
    pub slope_variance: f64,
}

impl LocalLinearTrend {
    pub fn new(level_variance: f64, slope_variance: f64) -> Self {
        Self {
            level_variance,
            slope_variance,
        }
    }
}

impl StateComponent for LocalLinearTrend {
    fn name(&self) -> &str {
        "trend"
    }

    fn dim(&self) -> usize {
        2
    }

    fn diffuse_dim(&self) -> usize {
        2
    }

    fn initial_covariance(&self, _pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        pi0.fill_diagonal(1.0);
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        tm[(0, 0)] = 1.0;
        tm[(0, 1)] = 1.0;
        tm[(1, 1)] = 1.0;
    }

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        x[0] += x[1];
    }

    fn apply_transposed_transition(&self, _t: usize, x: &mut [f64]) {
        x[1] += x[0];
    }

    fn has_innovation(&self, _t: usize) -> bool {
        self.level_variance > 0.0 || self.slope_variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        v[(0, 0)] = self.level_variance;
        v[(1, 1)] = self.slope_variance;
    }

    fn innovation_factor(&self, _t: usize, mut s: DMatrixViewMut<'_, f64>) {
        s[(0, 0)] = self.level_variance.max(0.0).sqrt();
        s[(1, 1)] = self.slope_variance.max(0.0).sqrt();
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        z[0] = 1.0;
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        x[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeasonalModel {
    /// Seasonal effects summing to zero over a period, shock on the newest effect.
    Dummy,
    /// Sum of harmonics, each with its own shock of common variance.
    Trigonometric,
}

/// Seasonal component with `period - 1` diffuse states.
#[derive(Debug, Clone)]
pub struct Seasonal {
    pub model: SeasonalModel,
    pub period: usize,
    pub variance: f64,
    harmonics: Vec<(f64, f64)>,
}

impl Seasonal {
    /// Fails unless `period >= 2`.
    pub fn new(model: SeasonalModel, period: usize, variance: f64) -> Result<Self> {
        if period < 2 {
            return Err(SsfError::InvalidSpec(format!(
                "seasonal period must be at least 2, got {}",
                period
            )));
        }
        let harmonics = (1..=(period - 1) / 2)
            .map(|j| {
                let lambda = 2.0 * PI * j as f64 / period as f64;
                (lambda.cos(), lambda.sin())
            })
            .collect();
        Ok(Self {
            model,
            period,
            variance,
            harmonics,
        })
    }

    fn has_nyquist(&self) -> bool {
        self.period % 2 == 0
    }
}

impl StateComponent for Seasonal {
    fn name(&self) -> &str {
        "seasonal"
    }

    fn dim(&self) -> usize {
        self.period - 1
    }

    fn diffuse_dim(&self) -> usize {
        self.period - 1
    }

    fn initial_covariance(&self, _pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        pi0.fill_diagonal(1.0);
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        let n = self.dim();
        match self.model {
            SeasonalModel::Dummy => {
                for j in 0..n {
                    tm[(0, j)] = -1.0;
                }
                for i in 1..n {
                    tm[(i, i - 1)] = 1.0;
                }
            }
            SeasonalModel::Trigonometric => {
                for (k, &(c, s)) in self.harmonics.iter().enumerate() {
                    let i = 2 * k;
                    tm[(i, i)] = c;
                    tm[(i, i + 1)] = s;
                    tm[(i + 1, i)] = -s;
                    tm[(i + 1, i + 1)] = c;
                }
                if self.has_nyquist() {
                    tm[(n - 1, n - 1)] = -1.0;
                }
            }
        }
    }

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        let n = x.len();
        match self.model {
            SeasonalModel::Dummy => {
                let head = -x.iter().sum::<f64>();
                x.copy_within(0..n - 1, 1);
                x[0] = head;
            }
            SeasonalModel::Trigonometric => {
                for (k, &(c, s)) in self.harmonics.iter().enumerate() {
                    let (a, b) = (x[2 * k], x[2 * k + 1]);
                    x[2 * k] = c * a + s * b;
                    x[2 * k + 1] = -s * a + c * b;
                }
                if self.has_nyquist() {
                    x[n - 1] = -x[n - 1];
                }
            }
        }
    }

    fn apply_transposed_transition(&self, _t: usize, x: &mut [f64]) {
        let n = x.len();
        match self.model {
            SeasonalModel::Dummy => {
                let x0 = x[0];
                for j in 0..n - 1 {
                    x[j] = x[j + 1] - x0;
                }
                x[n - 1] = -x0;
            }
            SeasonalModel::Trigonometric => {
                for (k, &(c, s)) in self.harmonics.iter().enumerate() {
                    let (a, b) = (x[2 * k], x[2 * k + 1]);
                    x[2 * k] = c * a - s * b;
                    x[2 * k + 1] = s * a + c * b;
                }
                if self.has_nyquist() {
                    x[n - 1] = -x[n - 1];
                }
            }
        }
    }

    fn has_innovation(&self, _t: usize) -> bool {
        self.variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        match self.model {
            SeasonalModel::Dummy => v[(0, 0)] = self.variance,
            SeasonalModel::Trigonometric => v.fill_diagonal(self.variance),
        }
    }

    fn innovation_factor(&self, _t: usize, mut s: DMatrixViewMut<'_, f64>) {
        let e = self.variance.max(0.0).sqrt();
        match self.model {
            SeasonalModel::Dummy => s[(0, 0)] = e,
            SeasonalModel::Trigonometric => s.fill_diagonal(e),
        }
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        match self.model {
            SeasonalModel::Dummy => z[0] = 1.0,
            SeasonalModel::Trigonometric => {
                for k in 0..self.harmonics.len() {
                    z[2 * k] = 1.0;
                }
                if self.has_nyquist() {
                    z[self.dim() - 1] = 1.0;
                }
            }
        }
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        match self.model {
            SeasonalModel::Dummy => x[0],
            SeasonalModel::Trigonometric => {
                let mut s: f64 = (0..self.harmonics.len()).map(|k| x[2 * k]).sum();
                if self.has_nyquist() {
                    s += x[self.dim() - 1];
                }
                s
            }
        }
    }
}

/// Stochastic cycle `rho * R(lambda)` with `lambda = 2 pi / period`.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub factor: f64,
    pub period: f64,
    pub variance: f64,
    cos: f64,
    sin: f64,
}

impl Cycle {
    pub fn new(factor: f64, period: f64, variance: f64) -> Self {
        let lambda = 2.0 * PI / period;
        Self {
            factor,
            period,
            variance,
            cos: factor * lambda.cos(),
            sin: factor * lambda.sin(),
        }
    }
}

impl StateComponent for Cycle {
    fn name(&self) -> &str {
        "cycle"
    }

    fn dim(&self) -> usize {
        2
    }

    fn initial_covariance(&self, mut pf0: DMatrixViewMut<'_, f64>, _pi0: DMatrixViewMut<'_, f64>) {
        let q = self.variance / (1.0 - self.factor * self.factor);
        pf0.fill_diagonal(q);
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        tm[(0, 0)] = self.cos;
        tm[(0, 1)] = self.sin;
        tm[(1, 0)] = -self.sin;
        tm[(1, 1)] = self.cos;
    }

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        let (a, b) = (x[0], x[1]);
        x[0] = self.cos * a + self.sin * b;
        x[1] = -self.sin * a + self.cos * b;
    }

    fn apply_transposed_transition(&self, _t: usize, x: &mut [f64]) {
        let (a, b) = (x[0], x[1]);
        x[0] = self.cos * a - self.sin * b;
        x[1] = self.sin * a + self.cos * b;
    }

    fn has_innovation(&self, _t: usize) -> bool {
        self.variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        v.fill_diagonal(self.variance);
    }

    fn innovation_factor(&self, _t: usize, mut s: DMatrixViewMut<'_, f64>) {
        s.fill_diagonal(self.variance.max(0.0).sqrt());
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        z[0] = 1.0;
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        x[0]
    }
}

/// White noise carried in the state.
#[derive(Debug, Clone)]
pub struct Noise {
    pub variance: f64,
}

impl Noise {
    pub fn new(variance: f64) -> Self {
        Self { variance }
    }
}

impl StateComponent for Noise {
    fn name(&self) -> &str {
        "noise"
    }

    fn dim(&self) -> usize {
        1
    }

    fn initial_covariance(&self, mut pf0: DMatrixViewMut<'_, f64>, _pi0: DMatrixViewMut<'_, f64>) {
        pf0[(0, 0)] = self.variance;
    }

    fn transition(&self, _t: usize, _tm: DMatrixViewMut<'_, f64>) {}

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        x[0] = 0.0;
    }

    fn apply_transposed_transition(&self, _t: usize, x: &mut [f64]) {
        x[0] = 0.0;
    }

    fn has_innovation(&self, _t: usize) -> bool {
        self.variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        v[(0, 0)] = self.variance;
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        z[0] = 1.0;
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        x[0]
    }
}

/// Regression effects carried in the state, with loading x(t).
///
/// Coefficients are diffuse. With `variances` set they follow random walks;
/// without, the component has no innovation at all. Rows beyond the end of
/// the design load as zero.
#[derive(Debug, Clone)]
pub struct RegressionComponent {
    design: Arc<DMatrix<f64>>,
    variances: Option<Vec<f64>>,
}

impl RegressionComponent {
    pub fn fixed(design: Arc<DMatrix<f64>>) -> Self {
        Self {
            design,
            variances: None,
        }
    }

    pub fn time_varying(design: Arc<DMatrix<f64>>, variances: Vec<f64>) -> Self {
        Self {
            design,
            variances: Some(variances),
        }
    }
}

impl StateComponent for RegressionComponent {
    fn name(&self) -> &str {
        "regression"
    }

    fn dim(&self) -> usize {
        self.design.ncols()
    }

    fn diffuse_dim(&self) -> usize {
        self.design.ncols()
    }

    fn initial_covariance(&self, _pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        pi0.fill_diagonal(1.0);
    }

    fn is_time_invariant(&self) -> bool {
        false
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        tm.fill_diagonal(1.0);
    }

    fn apply_transition(&self, _t: usize, _x: &mut [f64]) {}

    fn apply_transposed_transition(&self, _t: usize, _x: &mut [f64]) {}

    fn has_innovation(&self, _t: usize) -> bool {
        self.variances
            .as_ref()
            .is_some_and(|v| v.iter().any(|&q| q > 0.0))
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        if let Some(vars) = &self.variances {
            for (i, &q) in vars.iter().enumerate() {
                v[(i, i)] = q;
            }
        }
    }

    fn loading(&self, t: usize, z: &mut [f64]) {
        if t < self.design.nrows() {
            for (j, zj) in z.iter_mut().enumerate() {
                *zj = self.design[(t, j)];
            }
        }
    }

    fn zx(&self, t: usize, x: &[f64]) -> f64 {
        if t >= self.design.nrows() {
            return 0.0;
        }
        x.iter()
            .enumerate()
            .map(|(j, xj)| self.design[(t, j)] * xj)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{loading_vector, transition_matrix};
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn check_vector_forms(c: &dyn StateComponent, x: &[f64]) {
        let tm = transition_matrix(c, 0);
        let xv = DVector::from_column_slice(x);

        let mut fwd = x.to_vec();
        c.apply_transition(0, &mut fwd);
        let expected = &tm * &xv;
        for i in 0..x.len() {
            assert_relative_eq!(fwd[i], expected[i], epsilon = 1e-12);
        }

        let mut bwd = x.to_vec();
        c.apply_transposed_transition(0, &mut bwd);
        let expected = tm.transpose() * &xv;
        for i in 0..x.len() {
            assert_relative_eq!(bwd[i], expected[i], epsilon = 1e-12);
        }

        let z = loading_vector(c, 0);
        assert_relative_eq!(c.zx(0, x), z.dot(&xv), epsilon = 1e-12);
    }

    #[test]
    fn test_vector_forms_match_matrices() {
        check_vector_forms(&LocalLevel::new(1.0), &[2.5]);
        check_vector_forms(&LocalLinearTrend::new(1.0, 0.1), &[2.5, -0.7]);
        check_vector_forms(&Seasonal::new(SeasonalModel::Dummy, 4, 1.0).unwrap(), &[1.0, -2.0, 0.5]);
        check_vector_forms(
            &Seasonal::new(SeasonalModel::Trigonometric, 12, 1.0).unwrap(),
            &[1.0, -2.0, 0.5, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8],
        );
        check_vector_forms(
            &Seasonal::new(SeasonalModel::Trigonometric, 5, 1.0).unwrap(),
            &[1.0, -2.0, 0.5, 0.3],
        );
        check_vector_forms(&Cycle::new(0.9, 20.0, 1.0), &[1.0, -1.0]);
        check_vector_forms(&Noise::new(1.0), &[3.0]);
    }

    #[test]
    fn test_seasonal_period_checked() {
        for period in [0, 1] {
            let err = Seasonal::new(SeasonalModel::Dummy, period, 1.0).unwrap_err();
            assert!(matches!(err, SsfError::InvalidSpec(_)));
        }
        let c = Seasonal::new(SeasonalModel::Trigonometric, 2, 1.0).unwrap();
        assert_eq!(c.dim(), 1);
        assert_eq!(c.diffuse_dim(), 1);
    }

    #[test]
    fn test_dummy_seasonal_sums_to_zero() {
        let c = Seasonal::new(SeasonalModel::Dummy, 4, 0.0).unwrap();
        let mut x = vec![1.0, -3.0, 0.5];
        let mut path = vec![x[2], x[1], x[0]];
        for _ in 0..8 {
            c.apply_transition(0, &mut x);
            path.push(x[0]);
        }
        for w in path.windows(4) {
            assert_relative_eq!(w.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_trigonometric_seasonal_is_periodic() {
        let c = Seasonal::new(SeasonalModel::Trigonometric, 6, 0.0).unwrap();
        let x0 = vec![0.4, -1.0, 0.3, 0.2, 0.9];
        let mut x = x0.clone();
        for _ in 0..6 {
            c.apply_transition(0, &mut x);
        }
        for i in 0..5 {
            assert_relative_eq!(x[i], x0[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cycle_stationary_variance() {
        let c = Cycle::new(0.8, 12.0, 0.36);
        let mut pf0 = DMatrix::zeros(2, 2);
        let mut pi0 = DMatrix::zeros(2, 2);
        c.initial_covariance(pf0.view_mut((0, 0), (2, 2)), pi0.view_mut((0, 0), (2, 2)));
        // 0.36 / (1 - 0.64)
        assert_relative_eq!(pf0[(0, 0)], 1.0, epsilon = 1e-12);
        assert_eq!(c.diffuse_dim(), 0);
        assert_eq!(pi0, DMatrix::zeros(2, 2));
    }

    #[test]
    fn test_regression_loading_is_time_varying() {
        let x = Arc::new(DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]));
        let c = RegressionComponent::fixed(x);
        assert!(!c.is_time_invariant());
        assert!(!c.has_innovation(0));
        assert_eq!(c.diffuse_dim(), 2);
        assert_relative_eq!(c.zx(2, &[3.0, 0.5]), 4.0);
        assert_relative_eq!(c.zx(7, &[3.0, 0.5]), 0.0);
        let mut z = [0.0; 2];
        c.loading(1, &mut z);
        assert_eq!(z, [1.0, 1.0]);
    }
}
