//! Backward recursions over a [`FilterOutput`]: exact initial state
//! smoother, disturbance smoother and the fast state smoother used with
//! light storage.

use nalgebra::{DMatrix, DVector};

use crate::component::{innovation_matrix, loading_vector, StateComponent};
use crate::composite::CompositeModel;
use crate::error::{Result, SsfError};
use crate::filter::{FilterOutput, StepKind};
use crate::linalg::symmetrize;
use crate::types::StorageMode;

/// Relative size of the diffuse term of a smoothed variance above which the
/// direction is reported as unresolved.
const UNRESOLVED_TOL: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct SmoothedOutput {
    /// Smoothed states, t = 0..n.
    pub states: Vec<DVector<f64>>,
    /// Smoothed state covariances (full storage). Unresolved diffuse
    /// directions are `NaN`.
    pub variances: Option<Vec<DMatrix<f64>>>,
    /// Smoothed state disturbances V(t) r(t).
    pub state_disturbances: Vec<DVector<f64>>,
    pub state_disturbance_variances: Option<Vec<DMatrix<f64>>>,
    /// Smoothed measurement noise.
    pub measurement_disturbances: Vec<f64>,
    pub measurement_disturbance_variances: Option<Vec<f64>>,
}

impl SmoothedOutput {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Smoothed signal of component `i` of `model`.
    pub fn component(&self, model: &CompositeModel, i: usize) -> Vec<f64> {
        self.states
            .iter()
            .enumerate()
            .map(|(t, a)| model.component_signal(i, t, a.as_slice()))
            .collect()
    }

    /// Variance of the smoothed signal of component `i` (full storage).
    pub fn component_variance(&self, model: &CompositeModel, i: usize) -> Option<Vec<f64>> {
        let variances = self.variances.as_ref()?;
        let range = model.component_range(i);
        let c = model.component(i);
        Some(
            variances
                .iter()
                .enumerate()
                .map(|(t, v)| {
                    let z = loading_vector(c, t);
                    let block = v.view((range.start, range.start), (range.len(), range.len()));
                    (z.transpose() * block * &z)[(0, 0)]
                })
                .collect(),
        )
    }

    /// Smoothed signal Z(t) α̂(t) of the whole model.
    pub fn signal(&self, model: &dyn StateComponent) -> Vec<f64> {
        self.states
            .iter()
            .enumerate()
            .map(|(t, a)| model.zx(t, a.as_slice()))
            .collect()
    }
}

/// T' X T, using the vector form of the transposed transition.
fn sandwich(model: &dyn StateComponent, t: usize, x: &DMatrix<f64>) -> DMatrix<f64> {
    let rows = x.nrows();
    if rows == 0 {
        return x.clone();
    }
    let mut left = x.clone();
    for col in left.as_mut_slice().chunks_mut(rows) {
        model.apply_transposed_transition(t, col);
    }
    let mut right = left.transpose();
    for col in right.as_mut_slice().chunks_mut(rows) {
        model.apply_transposed_transition(t, col);
    }
    right.transpose()
}

/// I - k z'
fn gain_complement(k: &DVector<f64>, z: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::identity(k.len(), k.len()) - k * z.transpose()
}

/// Diagonal entries of the diffuse (kappa) term of the smoothed variance that
/// do not vanish.
fn unresolved(pf: &DMatrix<f64>, pi: &DMatrix<f64>, n0: &DMatrix<f64>, n1: &DMatrix<f64>) -> Vec<usize> {
    let scale = pi.diagonal().iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let cross = pi * n0 * pf;
    let d = pi - &cross - cross.transpose() - pi * n1 * pi;
    (0..d.nrows())
        .filter(|&i| d[(i, i)] > UNRESOLVED_TOL * scale)
        .collect()
}

/// Runs the backward pass. Smoothed covariances require full storage; with
/// light storage the states come from the fast state smoother.
#[tracing::instrument(skip(model, output), fields(n = output.len()))]
pub fn smooth(model: &dyn StateComponent, output: &FilterOutput) -> Result<SmoothedOutput> {
    let n = output.len();
    let dim = model.dim();
    if output.final_state.len() != dim {
        return Err(SsfError::DimensionMismatch {
            what: "filter output state",
            expected: dim,
            got: output.final_state.len(),
        });
    }
    let stored = match (&output.covariances, &output.diffuse_covariances) {
        (Some(c), Some(d)) if output.storage == StorageMode::Full => Some((c, d)),
        _ => None,
    };
    let full = stored.is_some();

    let fixed_v = model.is_time_invariant().then(|| innovation_matrix(model, 0));
    let fixed_z = model.is_time_invariant().then(|| loading_vector(model, 0));

    let mut r0 = DVector::zeros(dim);
    let mut r1 = DVector::zeros(dim);
    let mut n0 = DMatrix::zeros(dim, dim);
    let mut n1 = DMatrix::zeros(dim, dim);
    let mut n2 = DMatrix::zeros(dim, dim);

    let mut eta = vec![DVector::zeros(dim); n];
    let mut eta_var = full.then(|| vec![DMatrix::zeros(dim, dim); n]);
    let mut eps = vec![0.0; n];
    let mut eps_var = full.then(|| vec![0.0; n]);
    let mut states = full.then(|| vec![DVector::zeros(dim); n]);
    let mut variances = full.then(|| vec![DMatrix::zeros(dim, dim); n]);

    for t in (0..n).rev() {
        let v_owned;
        let z_owned;
        let v = match &fixed_v {
            Some(v) => v,
            None => {
                v_owned = innovation_matrix(model, t);
                &v_owned
            }
        };
        let z = match &fixed_z {
            Some(z) => z,
            None => {
                z_owned = loading_vector(model, t);
                &z_owned
            }
        };
        let h = model.measurement_variance(t);
        let step = &output.steps[t];
        let diffuse_period = t < output.diffuse_count;

        eta[t] = v * &r0;
        if let Some(ev) = eta_var.as_mut() {
            ev[t] = v - v * &n0 * v;
        }

        model.apply_transposed_transition(t, r0.as_mut_slice());
        if diffuse_period {
            model.apply_transposed_transition(t, r1.as_mut_slice());
        }
        if full {
            n0 = sandwich(model, t, &n0);
            if diffuse_period {
                n1 = sandwich(model, t, &n1);
                n2 = sandwich(model, t, &n2);
            }
        }

        match step.kind {
            StepKind::Missing | StepKind::Degenerate => {
                eps[t] = 0.0;
                if let Some(ev) = eps_var.as_mut() {
                    ev[t] = h;
                }
            }
            StepKind::Ordinary => {
                let f = step.f;
                let u = (step.e - step.m.dot(&r0)) / f;
                eps[t] = h * u;
                if let Some(ev) = eps_var.as_mut() {
                    let quad = step.m.dot(&(&n0 * &step.m));
                    ev[t] = h - h * h * (1.0 / f + quad / (f * f));
                }
                r0 += z * u;
                if full {
                    let a = gain_complement(&(&step.m / f), z);
                    n0 = z * z.transpose() / f + a.transpose() * &n0 * &a;
                    symmetrize(&mut n0);
                    if step.mi.is_some() {
                        n1 = &n1 * &a;
                    }
                }
            }
            StepKind::Diffuse => {
                let mi = step.mi.as_ref().ok_or_else(|| {
                    SsfError::Numerical(format!("diffuse step {} has no diffuse gain", t))
                })?;
                let (fi, ff) = (step.fi, step.f);
                let k0 = mi / fi;
                let k1 = &step.m / fi - mi * (ff / (fi * fi));

                eps[t] = -h * k0.dot(&r0);
                if let Some(ev) = eps_var.as_mut() {
                    ev[t] = h - h * h * k0.dot(&(&n0 * &k0));
                }

                let next_r1 = z * (step.e / fi) + &r1 - z * (k0.dot(&r1) + k1.dot(&r0));
                let c0 = k0.dot(&r0);
                r0 -= z * c0;
                r1 = next_r1;

                if full {
                    let l0 = gain_complement(&k0, z);
                    let l1 = -(&k1 * z.transpose());
                    let zz = z * z.transpose();
                    let next_n0 = l0.transpose() * &n0 * &l0;
                    let next_n1 = &zz / fi + l0.transpose() * &n1 * &l0 + l1.transpose() * &n0 * &l0;
                    let next_n2 = &zz * (-ff / (fi * fi))
                        + l0.transpose() * &n2 * &l0
                        + l0.transpose() * &n1 * &l1
                        + l1.transpose() * n1.transpose() * &l0
                        + l1.transpose() * &n0 * &l1;
                    n0 = next_n0;
                    symmetrize(&mut n0);
                    n1 = next_n1;
                    n2 = next_n2;
                    symmetrize(&mut n2);
                }
            }
        }

        if let (Some(st), Some(var), Some((covs, dcovs))) = (states.as_mut(), variances.as_mut(), stored) {
            let pf = &covs[t];
            let mut mean = &output.states[t] + pf * &r0;
            let mut vt = pf - pf * &n0 * pf;
            if let Some(pi) = &dcovs[t] {
                mean += pi * &r1;
                let cross = pi * &n1 * pf;
                vt -= &cross + cross.transpose() + pi * &n2 * pi;
                symmetrize(&mut vt);
                for i in unresolved(pf, pi, &n0, &n1) {
                    vt.row_mut(i).fill(f64::NAN);
                    vt.column_mut(i).fill(f64::NAN);
                }
            }
            st[t] = mean;
            var[t] = vt;
        }
    }

    let states = match states {
        Some(s) => s,
        None => {
            // fast state smoother: α̂(0) = a0 + Pf0 r0 + Pi0 r1, α̂(t+1) = T α̂(t) + η̂(t)
            let init = &output.initialization;
            let mut alpha = &init.a0 + &init.pf0 * &r0;
            if init.is_diffuse() {
                alpha += &init.pi0 * &r1;
            }
            let mut s = Vec::with_capacity(n);
            for (t, eta_t) in eta.iter().enumerate() {
                s.push(alpha.clone());
                model.apply_transition(t, alpha.as_mut_slice());
                alpha += eta_t;
            }
            s
        }
    };

    Ok(SmoothedOutput {
        states,
        variances,
        state_disturbances: eta,
        state_disturbance_variances: eta_var,
        measurement_disturbances: eps,
        measurement_disturbance_variances: eps_var,
    })
}
