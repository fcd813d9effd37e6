//! Exact diffuse Kalman filter (univariate, Durbin-Koopman).
//!
//! The filter runs each observation through a pure `step` that returns the
//! next state and a record of what happened. Keeping the step pure lets the
//! `Auto` covariance form replay a failed step in square-root form.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::component::{innovation_matrix, loading_vector, transition_matrix, StateComponent};
use crate::error::{Result, SsfError};
use crate::initialization::Initialization;
use crate::linalg::{is_positive_semidefinite, psd_factor, symmetrize, tria};
use crate::types::{CovarianceForm, FilterOptions, Observations, StorageMode};

/// Relative tolerance on F∞ for a diffuse update.
const DIFFUSE_TOL: f64 = 1e-9;
/// Relative tolerance below which F is treated as zero.
const DEGENERATE_TOL: f64 = 1e-13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// No observation: prediction only.
    Missing,
    /// Update against the diffuse part (F∞ > 0).
    Diffuse,
    /// Standard update. Contributes to `ssq` and `log_determinant`.
    Ordinary,
    /// F numerically zero: the update is skipped.
    Degenerate,
}

/// What the filter retains for one time step.
#[derive(Debug, Clone)]
pub struct FilterStep {
    pub kind: StepKind,
    /// Prediction error y(t) - Z a(t).
    pub e: f64,
    /// Finite part of the error variance, Z Pf Z' + h.
    pub f: f64,
    /// Diffuse part Z Pi Z' (0 outside the diffuse phase).
    pub fi: f64,
    /// Pf Z'
    pub m: DVector<f64>,
    /// Pi Z' while the diffuse phase is active.
    pub mi: Option<DVector<f64>>,
}

impl FilterStep {
    fn missing(dim: usize) -> Self {
        Self {
            kind: StepKind::Missing,
            e: 0.0,
            f: 0.0,
            fi: 0.0,
            m: DVector::zeros(dim),
            mi: None,
        }
    }

    /// Standardized prediction error, for ordinary steps.
    pub fn standardized(&self) -> Option<f64> {
        (self.kind == StepKind::Ordinary).then(|| self.e / self.f.sqrt())
    }
}

#[derive(Debug, Clone)]
enum Covariance {
    Direct(DMatrix<f64>),
    /// Lower factor L with P = LL'.
    Factor(DMatrix<f64>),
}

impl Covariance {
    fn matrix(&self) -> DMatrix<f64> {
        match self {
            Covariance::Direct(p) => p.clone(),
            Covariance::Factor(l) => l * l.transpose(),
        }
    }

    /// Largest diagonal entry of P. For a factor, the squared norm of its
    /// longest row.
    fn max_variance(&self) -> f64 {
        match self {
            Covariance::Direct(p) => max_diagonal(p),
            Covariance::Factor(l) => l
                .row_iter()
                .fold(0.0_f64, |acc, row| acc.max(row.norm_squared())),
        }
    }

    /// P z
    fn times(&self, z: &DVector<f64>) -> DVector<f64> {
        match self {
            Covariance::Direct(p) => p * z,
            Covariance::Factor(l) => l * (l.tr_mul(z)),
        }
    }

    fn into_factor(self) -> Covariance {
        match self {
            Covariance::Direct(p) => Covariance::Factor(psd_factor(p.as_view())),
            f => f,
        }
    }
}

#[derive(Debug, Clone)]
struct FilterState {
    a: DVector<f64>,
    cov: Covariance,
    pi: Option<DMatrix<f64>>,
    diffuse_left: usize,
}

/// System matrices at one time point. Built once for time-invariant models.
#[derive(Debug, Clone)]
struct System {
    t: DMatrix<f64>,
    v: Option<DMatrix<f64>>,
    s: Option<DMatrix<f64>>,
    z: DVector<f64>,
    h: f64,
}

impl System {
    fn at(model: &dyn StateComponent, t: usize) -> Self {
        let n = model.dim();
        let (v, s) = if model.has_innovation(t) {
            let mut s = DMatrix::zeros(n, n);
            model.innovation_factor(t, s.view_mut((0, 0), (n, n)));
            (Some(innovation_matrix(model, t)), Some(s))
        } else {
            (None, None)
        };
        Self {
            t: transition_matrix(model, t),
            v,
            s,
            z: loading_vector(model, t),
            h: model.measurement_variance(t),
        }
    }
}

struct SystemCache<'a> {
    model: &'a dyn StateComponent,
    fixed: Option<System>,
}

impl<'a> SystemCache<'a> {
    fn new(model: &'a dyn StateComponent) -> Self {
        let fixed = model.is_time_invariant().then(|| System::at(model, 0));
        Self { model, fixed }
    }

    fn get(&self, t: usize) -> std::borrow::Cow<'_, System> {
        match &self.fixed {
            Some(s) => std::borrow::Cow::Borrowed(s),
            None => std::borrow::Cow::Owned(System::at(self.model, t)),
        }
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub steps: Vec<FilterStep>,
    /// Predicted means a(t), t = 0..n.
    pub states: Vec<DVector<f64>>,
    /// Predicted finite covariances Pf(t) (full storage).
    pub covariances: Option<Vec<DMatrix<f64>>>,
    /// Predicted diffuse covariances Pi(t) (full storage, diffuse phase only).
    pub diffuse_covariances: Option<Vec<Option<DMatrix<f64>>>>,
    pub ssq: f64,
    pub log_determinant: f64,
    /// Sum of ln F∞ over diffuse updates.
    pub diffuse_correction: f64,
    /// Number of time steps consumed by the diffuse phase.
    pub diffuse_count: usize,
    /// Number of diffuse updates performed.
    pub diffuse_updates: usize,
    /// Diffuse dimensions left at the end (0 after a collapse).
    pub diffuse_remaining: usize,
    /// Number of ordinary updates.
    pub n_used: usize,
    /// a(n), the one-step-ahead prediction after the last observation.
    pub final_state: DVector<f64>,
    pub final_covariance: DMatrix<f64>,
    pub final_diffuse: Option<DMatrix<f64>>,
    pub initialization: Initialization,
    /// Form in effect at the end of the pass.
    pub form: CovarianceForm,
    /// First step run in square-root form by `Auto`.
    pub switched_at: Option<usize>,
    pub storage: StorageMode,
}

impl FilterOutput {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_collapsed(&self) -> bool {
        self.diffuse_remaining == 0
    }

    /// e/sqrt(F) of the ordinary steps, in time order.
    pub fn standardized_innovations(&self) -> Vec<f64> {
        self.steps.iter().filter_map(FilterStep::standardized).collect()
    }
}

fn degenerate(f: f64, scale: f64) -> bool {
    f <= DEGENERATE_TOL * scale.max(f64::MIN_POSITIVE)
}

fn max_diagonal(p: &DMatrix<f64>) -> f64 {
    p.diagonal().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

/// Pf <- (I - k z') Pf (I - k z')' + h k k'
fn joseph_update(cov: &Covariance, m: &DVector<f64>, k: &DVector<f64>, z: &DVector<f64>, f_or_ff: f64, h: f64) -> Covariance {
    match cov {
        Covariance::Direct(p) => {
            // expanded: Pf - k m' - m k' + k k' (z'Pf z + h)
            let mut next = p - k * m.transpose() - m * k.transpose() + k * k.transpose() * f_or_ff;
            symmetrize(&mut next);
            Covariance::Direct(next)
        }
        Covariance::Factor(l) => {
            let n = l.nrows();
            let mut stacked = DMatrix::zeros(n, n + 1);
            let kz = k * z.transpose();
            stacked
                .view_mut((0, 0), (n, n))
                .copy_from(&(l - &kz * l));
            stacked.set_column(n, &(k * h.max(0.0).sqrt()));
            Covariance::Factor(tria(stacked))
        }
    }
}

fn predict(state: &mut FilterState, model: &dyn StateComponent, t: usize, sys: &System) {
    model.apply_transition(t, state.a.as_mut_slice());
    let tm = &sys.t;
    state.cov = match &state.cov {
        Covariance::Direct(p) => {
            let mut next = tm * p * tm.transpose();
            if let Some(v) = &sys.v {
                next += v;
            }
            symmetrize(&mut next);
            Covariance::Direct(next)
        }
        Covariance::Factor(l) => {
            let n = l.nrows();
            let tl = tm * l;
            match &sys.s {
                Some(s) => {
                    let mut stacked = DMatrix::zeros(n, 2 * n);
                    stacked.view_mut((0, 0), (n, n)).copy_from(&tl);
                    stacked.view_mut((0, n), (n, n)).copy_from(s);
                    Covariance::Factor(tria(stacked))
                }
                None => Covariance::Factor(tria(tl)),
            }
        }
    };
    if let Some(pi) = state.pi.as_mut() {
        let mut next = tm * &*pi * tm.transpose();
        symmetrize(&mut next);
        *pi = next;
    }
}

/// One update + prediction. Returns the next state and the step record.
fn step(
    state: &FilterState,
    model: &dyn StateComponent,
    t: usize,
    y: Option<f64>,
    sys: &System,
) -> Result<(FilterState, FilterStep)> {
    let mut next = state.clone();
    let n = model.dim();
    let record = match y {
        None => FilterStep::missing(n),
        Some(yt) => {
            let z = &sys.z;
            let h = sys.h;
            let e = yt - model.zx(t, state.a.as_slice());
            let m = state.cov.times(z);
            let f = z.dot(&m) + h;
            let scale = state.cov.max_variance().max(h).max(1.0);
            if let Covariance::Direct(_) = state.cov {
                if f < -DEGENERATE_TOL * scale {
                    return Err(SsfError::NotPositiveDefinite { step: t });
                }
            }

            let diffuse = state.pi.as_ref().and_then(|pi| {
                let mi = pi * z;
                let fi = z.dot(&mi);
                let tol = DIFFUSE_TOL * max_diagonal(pi).max(1.0);
                (fi > tol).then_some((mi, fi))
            });

            match diffuse {
                Some((mi, fi)) => {
                    let k = &mi / fi;
                    next.a += &k * e;
                    next.cov = joseph_update(&state.cov, &m, &k, z, f, h);
                    if let Some(pi) = next.pi.as_mut() {
                        *pi -= &mi * mi.transpose() / fi;
                        symmetrize(pi);
                    }
                    next.diffuse_left = next.diffuse_left.saturating_sub(1);
                    FilterStep {
                        kind: StepKind::Diffuse,
                        e,
                        f,
                        fi,
                        m,
                        mi: Some(mi),
                    }
                }
                None if degenerate(f, scale) => FilterStep {
                    kind: StepKind::Degenerate,
                    e,
                    f,
                    fi: 0.0,
                    m,
                    mi: state.pi.as_ref().map(|pi| pi * z),
                },
                None => {
                    let k = &m / f;
                    next.a += &k * e;
                    next.cov = match &state.cov {
                        Covariance::Direct(p) => {
                            let mut p = p - &m * m.transpose() / f;
                            symmetrize(&mut p);
                            Covariance::Direct(p)
                        }
                        factor => joseph_update(factor, &m, &k, z, f, h),
                    };
                    FilterStep {
                        kind: StepKind::Ordinary,
                        e,
                        f,
                        fi: 0.0,
                        m,
                        mi: state.pi.as_ref().map(|pi| pi * z),
                    }
                }
            }
        }
    };
    if next.pi.is_some() && next.diffuse_left == 0 {
        next.pi = None;
    }
    predict(&mut next, model, t, sys);
    Ok((next, record))
}

/// Forward pass of the exact diffuse filter over `y`.
#[tracing::instrument(skip(model, y, options), fields(n = y.len(), dim = model.dim()))]
pub fn filter(model: &dyn StateComponent, y: &Observations, options: &FilterOptions) -> Result<FilterOutput> {
    let n = y.len();
    let init = Initialization::from_component(model);
    let cache = SystemCache::new(model);

    let initial_cov = match options.form {
        CovarianceForm::SquareRoot => Covariance::Factor(psd_factor(init.pf0.as_view())),
        CovarianceForm::Direct | CovarianceForm::Auto => Covariance::Direct(init.pf0.clone()),
    };
    let mut state = FilterState {
        a: init.a0.clone(),
        cov: initial_cov,
        pi: init.is_diffuse().then(|| init.pi0.clone()),
        diffuse_left: init.diffuse_dim,
    };

    let full = options.storage == StorageMode::Full;
    let mut steps = Vec::with_capacity(n);
    let mut states = Vec::with_capacity(n);
    let mut covariances = full.then(|| Vec::with_capacity(n));
    let mut diffuse_covariances = full.then(|| Vec::with_capacity(n));

    let mut ssq = 0.0;
    let mut log_determinant = 0.0;
    let mut diffuse_correction = 0.0;
    let mut diffuse_updates = 0;
    let mut diffuse_count = if init.is_diffuse() { n } else { 0 };
    let mut n_used = 0;
    let mut form = options.form;
    let mut switched_at = None;

    for t in 0..n {
        let sys = cache.get(t);
        states.push(state.a.clone());
        if let Some(c) = covariances.as_mut() {
            c.push(state.cov.matrix());
        }
        if let Some(d) = diffuse_covariances.as_mut() {
            d.push(state.pi.clone());
        }

        let attempt = step(&state, model, t, y.get(t), &sys);
        let switch = form == CovarianceForm::Auto
            && match &attempt {
                Ok((next, _)) => {
                    matches!(&next.cov, Covariance::Direct(p) if !is_positive_semidefinite(p))
                }
                Err(SsfError::NotPositiveDefinite { .. }) => true,
                Err(_) => false,
            };
        let (next, record) = if switch {
            debug!(step = t, "covariance lost definiteness, switching to square-root form");
            form = CovarianceForm::SquareRoot;
            switched_at = Some(t);
            state.cov = state.cov.into_factor();
            step(&state, model, t, y.get(t), &sys)?
        } else {
            attempt?
        };

        match record.kind {
            StepKind::Diffuse => {
                diffuse_updates += 1;
                diffuse_correction += record.fi.ln();
            }
            StepKind::Ordinary => {
                ssq += record.e * record.e / record.f;
                log_determinant += record.f.ln();
                n_used += 1;
            }
            StepKind::Missing | StepKind::Degenerate => {}
        }
        if state.pi.is_some() && next.pi.is_none() {
            diffuse_count = t + 1;
            debug!(step = t, "diffuse phase collapsed");
        }
        steps.push(record);
        state = next;
    }

    if state.diffuse_left > 0 && options.require_collapse {
        return Err(SsfError::NotObservable {
            remaining: state.diffuse_left,
            n,
        });
    }

    Ok(FilterOutput {
        steps,
        states,
        covariances,
        diffuse_covariances,
        ssq,
        log_determinant,
        diffuse_correction,
        diffuse_count,
        diffuse_updates,
        diffuse_remaining: state.diffuse_left,
        n_used,
        final_covariance: state.cov.matrix(),
        final_state: state.a,
        final_diffuse: state.pi,
        initialization: init,
        form: if form == CovarianceForm::Auto {
            CovarianceForm::Direct
        } else {
            form
        },
        switched_at,
        storage: options.storage,
    })
}

/// Runs a column through the gains of a previous pass (a0 = 0) and returns
/// its standardized prediction errors at the ordinary steps. Missing values
/// in `x` are read as 0.
pub fn filter_column(model: &dyn StateComponent, output: &FilterOutput, x: &[f64]) -> Vec<f64> {
    let mut a = vec![0.0; model.dim()];
    let mut out = Vec::with_capacity(output.n_used);
    for (t, s) in output.steps.iter().enumerate() {
        let xt = x.get(t).copied().filter(|v| v.is_finite()).unwrap_or(0.0);
        match s.kind {
            StepKind::Diffuse => {
                if let Some(mi) = &s.mi {
                    let e = xt - model.zx(t, &a);
                    for (ai, mi) in a.iter_mut().zip(mi.iter()) {
                        *ai += mi * e / s.fi;
                    }
                }
            }
            StepKind::Ordinary => {
                let e = xt - model.zx(t, &a);
                out.push(e / s.f.sqrt());
                for (ai, m) in a.iter_mut().zip(s.m.iter()) {
                    *ai += m * e / s.f;
                }
            }
            StepKind::Missing | StepKind::Degenerate => {}
        }
        model.apply_transition(t, &mut a);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arima::ArimaModel;
    use crate::components::{LocalLevel, LocalLinearTrend, Noise};
    use crate::composite::CompositeModel;
    use crate::mapping::SsfModel;
    use crate::types::ArimaOrder;
    use approx::assert_relative_eq;

    fn local_level(q: f64, h: f64) -> CompositeModel {
        CompositeModel::new(vec![Box::new(LocalLevel::new(q)), Box::new(Noise::new(h))], 0.0).unwrap()
    }

    fn ar1(phi: f64) -> CompositeModel {
        ArimaModel::new(ArimaOrder::arma(1, 0), vec![phi], 1.0)
            .unwrap()
            .to_ssf()
            .unwrap()
    }

    fn series(n: usize) -> Observations {
        Observations::new((0..n).map(|t| (t as f64 * 0.7).sin() * 3.0 + 0.05 * t as f64).collect())
    }

    #[test]
    fn test_factor_max_variance_matches_product() {
        let l = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.5, 1.0, 0.0, -1.5, 2.0, 0.3]);
        let p = &l * l.transpose();
        let direct = Covariance::Direct(p.clone()).max_variance();
        let factor = Covariance::Factor(l).max_variance();
        assert_relative_eq!(direct, max_diagonal(&p), epsilon = 1e-14);
        assert_relative_eq!(factor, direct, epsilon = 1e-12);
        assert_relative_eq!(factor, 6.34, epsilon = 1e-12);
    }

    fn options(form: CovarianceForm) -> FilterOptions {
        FilterOptions {
            form,
            ..FilterOptions::default()
        }
    }

    #[test]
    fn test_random_walk_collapses_after_one_observation() {
        let m = CompositeModel::single(Box::new(LocalLevel::new(1.0))).unwrap();
        let out = filter(&m, &series(20), &FilterOptions::default()).unwrap();
        assert_eq!(out.diffuse_count, 1);
        assert_eq!(out.diffuse_updates, 1);
        assert_eq!(out.n_used, 19);
        assert!(out.is_collapsed());
        assert_eq!(out.steps[0].kind, StepKind::Diffuse);
    }

    #[test]
    fn test_local_linear_trend_collapses_after_two() {
        let m = CompositeModel::new(vec![Box::new(LocalLinearTrend::new(1.0, 0.1))], 1.0).unwrap();
        let out = filter(&m, &series(30), &FilterOptions::default()).unwrap();
        assert_eq!(out.diffuse_count, 2);
        assert_eq!(out.diffuse_updates, 2);
        assert_eq!(out.n_used, 28);
    }

    #[test]
    fn test_leading_missing_delays_collapse() {
        let y = series(10).with_missing(&[0, 1]);
        let m = local_level(1.0, 1.0);
        let out = filter(&m, &y, &FilterOptions::default()).unwrap();
        assert_eq!(out.diffuse_count, 3);
        assert_eq!(out.steps[0].kind, StepKind::Missing);
        assert_eq!(out.n_used, 7);
    }

    #[test]
    fn test_all_missing_is_not_observable() {
        let y = Observations::new(vec![f64::NAN; 5]);
        let m = local_level(1.0, 1.0);
        let err = filter(&m, &y, &FilterOptions::default()).unwrap_err();
        assert!(matches!(err, SsfError::NotObservable { remaining: 1, n: 5 }));
        let opts = FilterOptions {
            require_collapse: false,
            ..FilterOptions::default()
        };
        let out = filter(&m, &y, &opts).unwrap();
        assert_eq!(out.diffuse_remaining, 1);
        assert_eq!(out.n_used, 0);
    }

    #[test]
    fn test_ar1_matches_closed_form() {
        let phi = 0.6;
        let y = [1.0, -0.5, 0.8, 0.3];
        let out = filter(&ar1(phi), &Observations::from_slice(&y), &FilterOptions::default()).unwrap();
        let mut ssq = y[0] * y[0] * (1.0 - phi * phi);
        let logdet = -(1.0 - phi * phi).ln();
        for t in 1..y.len() {
            let e = y[t] - phi * y[t - 1];
            ssq += e * e;
        }
        assert_relative_eq!(out.ssq, ssq, epsilon = 1e-10);
        assert_relative_eq!(out.log_determinant, logdet, epsilon = 1e-10);
        assert_eq!(out.diffuse_count, 0);
    }

    #[test]
    fn test_forms_agree_on_regular_model() {
        let m = local_level(0.5, 2.0);
        let y = series(40).with_missing(&[5, 17]);
        let direct = filter(&m, &y, &options(CovarianceForm::Direct)).unwrap();
        let sqrt = filter(&m, &y, &options(CovarianceForm::SquareRoot)).unwrap();
        assert_relative_eq!(direct.ssq, sqrt.ssq, max_relative = 1e-10);
        assert_relative_eq!(direct.log_determinant, sqrt.log_determinant, max_relative = 1e-10);
        for (a, b) in direct.states.iter().zip(sqrt.states.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_eq!(sqrt.form, CovarianceForm::SquareRoot);
    }

    #[test]
    fn test_full_storage_keeps_covariances() {
        let m = local_level(1.0, 1.0);
        let opts = FilterOptions {
            storage: StorageMode::Full,
            ..FilterOptions::default()
        };
        let out = filter(&m, &series(6), &opts).unwrap();
        let covs = out.covariances.as_ref().unwrap();
        let diffuse = out.diffuse_covariances.as_ref().unwrap();
        assert_eq!(covs.len(), 6);
        assert!(diffuse[0].is_some());
        assert!(diffuse[1].is_none());
        // after the diffuse update Pf(1) = h + q
        assert_relative_eq!(covs[1][(0, 0)], 2.0, epsilon = 1e-12);
        assert!(filter(&m, &series(6), &FilterOptions::default()).unwrap().covariances.is_none());
    }

    #[test]
    fn test_deterministic_observations_are_skipped() {
        // zero variances everywhere: after the level is known F = 0
        let m = CompositeModel::single(Box::new(LocalLevel::new(0.0))).unwrap();
        let y = Observations::from_slice(&[2.0, 2.0, 2.0]);
        let out = filter(&m, &y, &FilterOptions::default()).unwrap();
        assert_eq!(out.steps[1].kind, StepKind::Degenerate);
        assert_eq!(out.n_used, 0);
    }

    #[test]
    fn test_column_through_same_gains() {
        let m = local_level(1.0, 1.0);
        let y = series(25);
        let out = filter(&m, &y, &FilterOptions::default()).unwrap();
        let again = filter_column(&m, &out, y.values());
        let direct = out.standardized_innovations();
        assert_eq!(again.len(), direct.len());
        for (a, b) in again.iter().zip(direct.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_constant_column_is_absorbed_by_level() {
        let m = local_level(0.0, 1.0);
        let out = filter(&m, &series(10), &FilterOptions::default()).unwrap();
        let col = filter_column(&m, &out, &[1.0; 10]);
        assert!(col.iter().all(|v| v.abs() < 1e-10));
    }
}
