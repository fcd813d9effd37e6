use nalgebra::{DMatrix, DVector};

use crate::component::StateComponent;
use crate::error::{Result, SsfError};
use crate::linalg::{max_abs, symmetrize};

const DOUBLING_MAX_ITER: usize = 64;

/// Initial state distribution: a0, finite covariance Pf0 and diffuse
/// indicator Pi0 (P0 = Pf0 + kappa * Pi0 with kappa -> infinity).
#[derive(Debug, Clone)]
pub struct Initialization {
    pub a0: DVector<f64>,
    pub pf0: DMatrix<f64>,
    pub pi0: DMatrix<f64>,
    pub diffuse_dim: usize,
}

impl Initialization {
    pub fn from_component(c: &dyn StateComponent) -> Self {
        let n = c.dim();
        let mut a0 = DVector::zeros(n);
        c.initial_state(a0.as_mut_slice());
        let mut pf0 = DMatrix::zeros(n, n);
        let mut pi0 = DMatrix::zeros(n, n);
        c.initial_covariance(pf0.view_mut((0, 0), (n, n)), pi0.view_mut((0, 0), (n, n)));
        Self {
            a0,
            pf0,
            pi0,
            diffuse_dim: c.diffuse_dim(),
        }
    }

    pub fn is_diffuse(&self) -> bool {
        self.diffuse_dim > 0
    }
}

/// Solution P of P = T P T' + Q by the doubling algorithm.
///
/// Fails when T is not stable (T^(2^k) does not vanish).
pub fn stationary_covariance(t: &DMatrix<f64>, q: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let mut p = q.clone();
    let mut a = t.clone();
    for _ in 0..DOUBLING_MAX_ITER {
        let increment = &a * &p * a.transpose();
        p += &increment;
        a = &a * &a;
        if !p.iter().all(|v| v.is_finite()) {
            break;
        }
        if max_abs(&a) < 1e-15 || max_abs(&increment) <= 1e-15 * max_abs(&p) {
            symmetrize(&mut p);
            return Ok(p);
        }
    }
    Err(SsfError::Numerical(
        "stationary covariance does not exist: transition is not stable".into(),
    ))
}
