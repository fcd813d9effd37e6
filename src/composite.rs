use std::ops::Range;

use nalgebra::DMatrixViewMut;

use crate::component::StateComponent;
use crate::error::{Result, SsfError};

/// Concatenation of components into one state vector.
///
/// Component `i` owns the state slice `positions[i]..positions[i + 1]`.
/// The measurement equation sums the component signals plus white noise
/// of variance `measurement_variance`.
#[derive(Debug)]
pub struct CompositeModel {
    components: Vec<Box<dyn StateComponent>>,
    positions: Vec<usize>,
    measurement_variance: f64,
    time_invariant: bool,
    diffuse_dim: usize,
}

impl CompositeModel {
    pub fn new(components: Vec<Box<dyn StateComponent>>, measurement_variance: f64) -> Result<Self> {
        if components.is_empty() {
            return Err(SsfError::InvalidSpec("a model needs at least one component".into()));
        }
        if !(measurement_variance >= 0.0 && measurement_variance.is_finite()) {
            return Err(SsfError::InvalidSpec(format!(
                "measurement variance must be finite and non-negative, got {}",
                measurement_variance
            )));
        }
        let mut positions = Vec::with_capacity(components.len() + 1);
        positions.push(0);
        for c in &components {
            if c.dim() == 0 {
                return Err(SsfError::InvalidSpec(format!(
                    "component '{}' has no state",
                    c.name()
                )));
            }
            let last = positions[positions.len() - 1];
            positions.push(last + c.dim());
        }
        let time_invariant = components.iter().all(|c| c.is_time_invariant());
        let diffuse_dim = components.iter().map(|c| c.diffuse_dim()).sum();
        Ok(Self {
            components,
            positions,
            measurement_variance,
            time_invariant,
            diffuse_dim,
        })
    }

    /// Single-component model without measurement noise.
    pub fn single(component: Box<dyn StateComponent>) -> Result<Self> {
        Self::new(vec![component], 0.0)
    }

    /// Start offsets of each component, followed by the total dimension.
    pub fn components_position(&self) -> &[usize] {
        &self.positions
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, i: usize) -> &dyn StateComponent {
        self.components[i].as_ref()
    }

    pub fn component_range(&self, i: usize) -> Range<usize> {
        self.positions[i]..self.positions[i + 1]
    }

    /// Index of the first component with the given name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name() == name)
    }

    /// Contribution Z_i(t) x_i of component `i` to the signal.
    pub fn component_signal(&self, i: usize, t: usize, x: &[f64]) -> f64 {
        self.components[i].zx(t, &x[self.component_range(i)])
    }
}

impl StateComponent for CompositeModel {
    fn name(&self) -> &str {
        "composite"
    }

    fn dim(&self) -> usize {
        self.positions[self.positions.len() - 1]
    }

    fn diffuse_dim(&self) -> usize {
        self.diffuse_dim
    }

    fn initial_state(&self, a0: &mut [f64]) {
        for (i, c) in self.components.iter().enumerate() {
            c.initial_state(&mut a0[self.component_range(i)]);
        }
    }

    fn initial_covariance(&self, mut pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        for (i, c) in self.components.iter().enumerate() {
            let (s, d) = (self.positions[i], c.dim());
            c.initial_covariance(pf0.view_mut((s, s), (d, d)), pi0.view_mut((s, s), (d, d)));
        }
    }

    fn is_time_invariant(&self) -> bool {
        self.time_invariant
    }

    fn transition(&self, t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        for (i, c) in self.components.iter().enumerate() {
            let (s, d) = (self.positions[i], c.dim());
            c.transition(t, tm.view_mut((s, s), (d, d)));
        }
    }

    fn apply_transition(&self, t: usize, x: &mut [f64]) {
        for (i, c) in self.components.iter().enumerate() {
            c.apply_transition(t, &mut x[self.component_range(i)]);
        }
    }

    fn apply_transposed_transition(&self, t: usize, x: &mut [f64]) {
        for (i, c) in self.components.iter().enumerate() {
            c.apply_transposed_transition(t, &mut x[self.component_range(i)]);
        }
    }

    fn has_innovation(&self, t: usize) -> bool {
        self.components.iter().any(|c| c.has_innovation(t))
    }

    fn innovation_covariance(&self, t: usize, mut v: DMatrixViewMut<'_, f64>) {
        for (i, c) in self.components.iter().enumerate() {
            if c.has_innovation(t) {
                let (s, d) = (self.positions[i], c.dim());
                c.innovation_covariance(t, v.view_mut((s, s), (d, d)));
            }
        }
    }

    fn innovation_factor(&self, t: usize, mut f: DMatrixViewMut<'_, f64>) {
        for (i, c) in self.components.iter().enumerate() {
            if c.has_innovation(t) {
                let (s, d) = (self.positions[i], c.dim());
                c.innovation_factor(t, f.view_mut((s, s), (d, d)));
            }
        }
    }

    fn loading(&self, t: usize, z: &mut [f64]) {
        for (i, c) in self.components.iter().enumerate() {
            c.loading(t, &mut z[self.component_range(i)]);
        }
    }

    fn zx(&self, t: usize, x: &[f64]) -> f64 {
        (0..self.components.len())
            .map(|i| self.component_signal(i, t, x))
            .sum()
    }

    fn measurement_variance(&self, t: usize) -> f64 {
        self.measurement_variance
            + self
                .components
                .iter()
                .map(|c| c.measurement_variance(t))
                .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{innovation_matrix, loading_vector, transition_matrix};
    use crate::components::{Cycle, LocalLinearTrend, Seasonal, SeasonalModel};
    use crate::initialization::Initialization;
    use nalgebra::DVector;

    fn bsm() -> CompositeModel {
        CompositeModel::new(
            vec![
                Box::new(LocalLinearTrend::new(1.0, 0.1)),
                Box::new(Seasonal::new(SeasonalModel::Dummy, 4, 0.5).unwrap()),
                Box::new(Cycle::new(0.9, 10.0, 0.2)),
            ],
            2.0,
        )
        .unwrap()
    }

    #[test]
    fn test_positions_and_dims() {
        let m = bsm();
        assert_eq!(m.components_position(), &[0, 2, 5, 7]);
        assert_eq!(m.dim(), 7);
        assert_eq!(m.diffuse_dim(), 5);
        assert_eq!(m.component_range(1), 2..5);
        assert_eq!(m.find("cycle"), Some(2));
        assert_eq!(m.measurement_variance(0), 2.0);
        assert!(m.is_time_invariant());
    }

    #[test]
    fn test_block_diagonal_matrices() {
        let m = bsm();
        let tm = transition_matrix(&m, 0);
        assert_eq!(tm[(0, 1)], 1.0);
        assert_eq!(tm[(2, 2)], -1.0);
        assert_eq!(tm[(0, 2)], 0.0);
        let v = innovation_matrix(&m, 0);
        assert_eq!(v[(1, 1)], 0.1);
        assert_eq!(v[(2, 2)], 0.5);
        assert_eq!(v[(3, 3)], 0.0);
        assert_eq!(v[(5, 5)], 0.2);
        let z = loading_vector(&m, 0);
        assert_eq!(z.as_slice(), &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_vector_dispatch_matches_matrix() {
        let m = bsm();
        let x = DVector::from_vec(vec![1.0, 0.5, -1.0, 2.0, 0.3, 0.7, -0.2]);
        let mut y = x.clone();
        m.apply_transition(0, y.as_mut_slice());
        let expected = transition_matrix(&m, 0) * &x;
        assert!((y - expected).amax() < 1e-12);
        assert!((m.zx(0, x.as_slice()) - (1.0 - 1.0 + 0.7)).abs() < 1e-12);
    }

    #[test]
    fn test_initialization_blocks() {
        let m = bsm();
        let init = Initialization::from_component(&m);
        assert_eq!(init.diffuse_dim, 5);
        assert_eq!(init.pi0[(4, 4)], 1.0);
        assert_eq!(init.pi0[(5, 5)], 0.0);
        assert!(init.pf0[(5, 5)] > 0.0);
    }

    #[test]
    fn test_empty_model_rejected() {
        assert!(CompositeModel::new(vec![], 0.0).is_err());
        assert!(CompositeModel::new(vec![Box::new(LocalLinearTrend::new(1.0, 1.0))], -1.0).is_err());
    }
}
