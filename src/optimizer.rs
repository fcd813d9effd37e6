//! Minimizers for the estimation loop.
//!
//! This module provides:
//! - The `Objective` contract evaluated by every solver
//! - Numerical gradient, Jacobian and Hessian (rayon across coordinates)
//! - A Levenberg-Marquardt solver for least-squares objectives
//! - argmin L-BFGS and Nelder-Mead on `-log L`
//! - `MinimizerKind::build` and `select_minimizer`, the only ways to obtain one

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SsfError};

/// Cost reported to argmin for points that cannot be evaluated.
const PENALTY: f64 = f64::MAX / 2.0;

/// Damping above which LM gives up on finding a decrease.
const MAX_DAMPING: f64 = 1e32;

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// An evaluated parameter vector.
#[derive(Debug, Clone)]
pub struct ObjectivePoint {
    /// The admitted parameters (possibly changed by validation).
    pub parameters: DVector<f64>,
    /// Minimized value, `-log L` for likelihood objectives.
    pub value: f64,
    /// Residuals of the least-squares form, when the objective has one.
    pub residuals: Option<DVector<f64>>,
}

impl ObjectivePoint {
    pub fn sum_of_squares(&self) -> Option<f64> {
        self.residuals.as_ref().map(|r| r.norm_squared())
    }
}

/// Function minimized by a `Minimizer`.
///
/// `evaluate` validates its input: inadmissible points fail with a
/// recoverable error (usually `BoundaryViolation`), repairable ones are
/// evaluated at the repaired parameters returned in the point.
pub trait Objective: Sync {
    fn dim(&self) -> usize;

    fn evaluate(&self, p: &DVector<f64>) -> Result<ObjectivePoint>;

    /// Step used for the numerical derivative along `idx`.
    fn epsilon(&self, p: &DVector<f64>, idx: usize) -> f64;

    /// Whether derivative probes may run on the rayon pool.
    fn parallel(&self) -> bool {
        false
    }
}

/// Objective wrapper counting evaluations, shared across rayon workers.
struct Counted<'a> {
    inner: &'a dyn Objective,
    evaluations: AtomicUsize,
}

impl<'a> Counted<'a> {
    fn new(inner: &'a dyn Objective) -> Self {
        Self {
            inner,
            evaluations: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }
}

impl Objective for Counted<'_> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn evaluate(&self, p: &DVector<f64>) -> Result<ObjectivePoint> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.inner.evaluate(p)
    }

    fn epsilon(&self, p: &DVector<f64>, idx: usize) -> f64 {
        self.inner.epsilon(p, idx)
    }

    fn parallel(&self) -> bool {
        self.inner.parallel()
    }
}

// ---------------------------------------------------------------------------
// Numerical derivatives
// ---------------------------------------------------------------------------

fn map_coordinates<T, F>(parallel: bool, n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if parallel {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// Point one step away along `i`, forward if admissible, else backward.
/// Returns the point and the signed step.
fn probe(objective: &dyn Objective, p: &DVector<f64>, i: usize) -> Option<(ObjectivePoint, f64)> {
    let eps = objective.epsilon(p, i);
    for h in [eps, -eps] {
        let mut q = p.clone();
        q[i] += h;
        match objective.evaluate(&q) {
            Ok(point) if point.value.is_finite() && point.parameters == q => return Some((point, h)),
            Ok(_) => debug!(index = i, step = h, "derivative probe moved by validation"),
            Err(e) => debug!(index = i, step = h, error = %e, "derivative probe rejected"),
        }
    }
    None
}

/// Forward-difference gradient of the objective value at `at`.
pub fn gradient(objective: &dyn Objective, at: &ObjectivePoint) -> Result<DVector<f64>> {
    let p = &at.parameters;
    let partials = map_coordinates(objective.parallel(), p.len(), |i| {
        probe(objective, p, i).map(|(point, h)| (point.value - at.value) / h)
    });
    let partials: Option<Vec<f64>> = partials.into_iter().collect();
    partials
        .map(DVector::from_vec)
        .ok_or_else(|| SsfError::Numerical("gradient undefined at the current point".into()))
}

/// Forward-difference Jacobian of the residuals at `at` (m x n).
pub fn jacobian(objective: &dyn Objective, at: &ObjectivePoint) -> Result<DMatrix<f64>> {
    let r0 = at
        .residuals
        .as_ref()
        .ok_or_else(|| SsfError::InvalidSpec("objective has no least-squares form".into()))?;
    let p = &at.parameters;
    if p.is_empty() {
        return Ok(DMatrix::zeros(r0.len(), 0));
    }
    let columns = map_coordinates(objective.parallel(), p.len(), |i| {
        probe(objective, p, i).and_then(|(point, h)| {
            point
                .residuals
                .filter(|r| r.len() == r0.len())
                .map(|r| (r - r0) / h)
        })
    });
    let columns: Option<Vec<DVector<f64>>> = columns.into_iter().collect();
    let columns =
        columns.ok_or_else(|| SsfError::Numerical("jacobian undefined at the current point".into()))?;
    Ok(DMatrix::from_columns(&columns))
}

/// Central-difference Hessian of the objective value at `at`.
pub fn hessian(objective: &dyn Objective, at: &ObjectivePoint) -> Result<DMatrix<f64>> {
    let p = &at.parameters;
    let n = p.len();
    let h: Vec<f64> = (0..n).map(|i| objective.epsilon(p, i)).collect();
    let pairs: Vec<(usize, usize)> = (0..n).flat_map(|i| (0..=i).map(move |j| (i, j))).collect();

    let value = |moves: &[(usize, f64)]| -> Result<f64> {
        let mut q = p.clone();
        for &(i, s) in moves {
            q[i] += s * h[i];
        }
        let point = objective.evaluate(&q)?;
        if point.parameters != q || !point.value.is_finite() {
            return Err(SsfError::Numerical("hessian probe left the admissible region".into()));
        }
        Ok(point.value)
    };

    let entries = map_coordinates(objective.parallel(), pairs.len(), |k| -> Result<f64> {
        let (i, j) = pairs[k];
        if i == j {
            let fp = value(&[(i, 2.0)])?;
            let fm = value(&[(i, -2.0)])?;
            Ok((fp - 2.0 * at.value + fm) / (4.0 * h[i] * h[i]))
        } else {
            let fpp = value(&[(i, 1.0), (j, 1.0)])?;
            let fpm = value(&[(i, 1.0), (j, -1.0)])?;
            let fmp = value(&[(i, -1.0), (j, 1.0)])?;
            let fmm = value(&[(i, -1.0), (j, -1.0)])?;
            Ok((fpp - fpm - fmp + fmm) / (4.0 * h[i] * h[j]))
        }
    });

    let mut out = DMatrix::zeros(n, n);
    for (&(i, j), entry) in pairs.iter().zip(entries) {
        let v = entry?;
        out[(i, j)] = v;
        out[(j, i)] = v;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MinimizerSettings {
    pub max_iterations: usize,
    pub max_evaluations: usize,
    /// Relative tolerance on steps and cost changes.
    pub tolerance: f64,
    pub gradient_tolerance: f64,
    pub lbfgs_memory: usize,
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_evaluations: 20_000,
            tolerance: 1e-9,
            gradient_tolerance: 1e-5,
            lbfgs_memory: 10,
        }
    }
}

/// What a minimizer needs from, or offers to, an objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Works on the residuals of a least-squares form.
    pub least_squares: bool,
    pub uses_gradient: bool,
    /// Rejects inadmissible trial points instead of penalizing them.
    pub bounded: bool,
}

impl Capabilities {
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        (self.least_squares || !required.least_squares)
            && (self.uses_gradient || !required.uses_gradient)
            && (self.bounded || !required.bounded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MinimizerKind {
    LevenbergMarquardt,
    Lbfgs,
    NelderMead,
}

impl MinimizerKind {
    pub fn capabilities(self) -> Capabilities {
        match self {
            MinimizerKind::LevenbergMarquardt => Capabilities {
                least_squares: true,
                uses_gradient: true,
                bounded: true,
            },
            MinimizerKind::Lbfgs => Capabilities {
                least_squares: false,
                uses_gradient: true,
                bounded: false,
            },
            MinimizerKind::NelderMead => Capabilities::default(),
        }
    }

    pub fn build(self, settings: &MinimizerSettings) -> Box<dyn Minimizer> {
        match self {
            MinimizerKind::LevenbergMarquardt => Box::new(LevenbergMarquardt::new(settings.clone())),
            MinimizerKind::Lbfgs => Box::new(Lbfgs::new(settings.clone())),
            MinimizerKind::NelderMead => Box::new(NelderMeadSimplex::new(settings.clone())),
        }
    }
}

/// The least capable minimizer offering everything in `required`.
pub fn select_minimizer(required: Capabilities, settings: &MinimizerSettings) -> Result<Box<dyn Minimizer>> {
    [
        MinimizerKind::NelderMead,
        MinimizerKind::Lbfgs,
        MinimizerKind::LevenbergMarquardt,
    ]
    .into_iter()
    .find(|kind| kind.capabilities().satisfies(&required))
    .map(|kind| kind.build(settings))
    .ok_or_else(|| SsfError::InvalidSpec(format!("no minimizer offers {:?}", required)))
}

#[derive(Debug, Clone)]
pub struct MinimizerOutcome {
    /// Best point found.
    pub point: ObjectivePoint,
    pub converged: bool,
    pub iterations: usize,
    pub evaluations: usize,
}

pub trait Minimizer: fmt::Debug + Send + Sync {
    fn kind(&self) -> MinimizerKind;

    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Minimizes from `start`. A failure at `start` is returned as an error;
    /// failures at trial points only reject them.
    fn minimize(&self, objective: &dyn Objective, start: &DVector<f64>) -> Result<MinimizerOutcome>;
}

// ---------------------------------------------------------------------------
// Levenberg-Marquardt
// ---------------------------------------------------------------------------

/// Damped Gauss-Newton on `0.5 * ||r||^2` with a gain-ratio trust region.
///
/// The damping starts at `mu_init * max diag(J'J)`, is divided by 10 after an
/// accepted step and multiplied by 10 after a rejection. Trial points that
/// fail to evaluate are rejected like points that do not decrease the cost.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    settings: MinimizerSettings,
    mu_init: f64,
    mu_increase: f64,
    mu_decrease: f64,
}

enum Trial {
    Accepted(ObjectivePoint, f64),
    /// The damped step fell below the step tolerance.
    Small,
    Exhausted,
}

impl LevenbergMarquardt {
    pub fn new(settings: MinimizerSettings) -> Self {
        Self {
            settings,
            mu_init: 1e-3,
            mu_increase: 10.0,
            mu_decrease: 0.1,
        }
    }
}

/// Solves `(J'J + mu I) delta = -g`.
fn solve_damped(jtj: &DMatrix<f64>, mu: f64, g: &DVector<f64>) -> Option<DVector<f64>> {
    let n = jtj.nrows();
    let damped = jtj + DMatrix::identity(n, n) * mu;
    damped.cholesky().map(|c| c.solve(&(-g)))
}

impl Minimizer for LevenbergMarquardt {
    fn kind(&self) -> MinimizerKind {
        MinimizerKind::LevenbergMarquardt
    }

    fn minimize(&self, objective: &dyn Objective, start: &DVector<f64>) -> Result<MinimizerOutcome> {
        let s = &self.settings;
        let counted = Counted::new(objective);
        let mut current = counted.evaluate(start)?;
        let mut r = current
            .residuals
            .clone()
            .ok_or_else(|| SsfError::InvalidSpec("objective has no least-squares form".into()))?;
        let mut cost = 0.5 * r.norm_squared();
        let mut mu: Option<f64> = None;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < s.max_iterations && counted.count() < s.max_evaluations {
            iterations += 1;
            let j = match jacobian(&counted, &current) {
                Ok(j) => j,
                Err(e) if e.is_recoverable() => {
                    debug!(error = %e, "LM stopped: jacobian unavailable");
                    break;
                }
                Err(e) => return Err(e),
            };
            let jtj = j.tr_mul(&j);
            let g = j.tr_mul(&r);
            if g.amax() <= s.gradient_tolerance * (1.0 + cost) {
                converged = true;
                break;
            }

            let mut damping = match mu {
                Some(m) => m,
                None => self.mu_init * jtj.diagonal().max().max(f64::MIN_POSITIVE),
            };
            let x_norm = current.parameters.norm();
            let trial = loop {
                if counted.count() >= s.max_evaluations || damping > MAX_DAMPING {
                    break Trial::Exhausted;
                }
                let Some(delta) = solve_damped(&jtj, damping, &g) else {
                    damping *= self.mu_increase;
                    continue;
                };
                if delta.norm() <= s.tolerance * (1.0 + x_norm) {
                    break Trial::Small;
                }
                let predicted = delta.dot(&(&delta * damping - &g));
                let candidate = &current.parameters + &delta;
                match counted.evaluate(&candidate) {
                    Ok(point) => {
                        let new_cost = point
                            .residuals
                            .as_ref()
                            .filter(|rn| rn.len() == r.len())
                            .map(|rn| 0.5 * rn.norm_squared());
                        if let Some(new_cost) = new_cost {
                            let actual = cost - new_cost;
                            if predicted > 0.0 && actual / predicted > 0.0 {
                                break Trial::Accepted(point, actual);
                            }
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        debug!(error = %e, damping, "LM trial point rejected");
                    }
                    Err(e) => return Err(e),
                }
                damping *= self.mu_increase;
            };

            match trial {
                Trial::Accepted(point, actual) => {
                    let step = (&point.parameters - &current.parameters).norm();
                    current = point;
                    if let Some(rn) = current.residuals.clone() {
                        r = rn;
                    }
                    cost = 0.5 * r.norm_squared();
                    mu = Some(damping * self.mu_decrease);
                    if step <= s.tolerance * (1.0 + current.parameters.norm())
                        || actual.abs() <= s.tolerance * (1.0 + cost)
                    {
                        converged = true;
                        break;
                    }
                }
                Trial::Small => {
                    converged = true;
                    break;
                }
                Trial::Exhausted => break,
            }
        }

        Ok(MinimizerOutcome {
            point: current,
            converged,
            iterations,
            evaluations: counted.count(),
        })
    }
}

// ---------------------------------------------------------------------------
// argmin solvers
// ---------------------------------------------------------------------------

/// Bridges an `Objective` to argmin. Failed points cost `PENALTY`; the best
/// evaluated point is tracked so that an aborted run still reports it.
struct ArgminProblem<'a, 'b> {
    objective: &'a Counted<'b>,
    max_evaluations: usize,
    best: &'a RefCell<Option<ObjectivePoint>>,
    fatal: &'a RefCell<Option<SsfError>>,
}

impl ArgminProblem<'_, '_> {
    fn point(&self, param: &[f64]) -> std::result::Result<Option<ObjectivePoint>, argmin::core::Error> {
        if self.objective.count() >= self.max_evaluations {
            return Err(argmin::core::Error::msg("evaluation budget exhausted"));
        }
        match self.objective.evaluate(&DVector::from_column_slice(param)) {
            Ok(point) if point.value.is_finite() => {
                let mut best = self.best.borrow_mut();
                if best.as_ref().map_or(true, |b| point.value < b.value) {
                    *best = Some(point.clone());
                }
                Ok(Some(point))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "trial point penalized");
                Ok(None)
            }
            Err(e) => {
                let msg = e.to_string();
                *self.fatal.borrow_mut() = Some(e);
                Err(argmin::core::Error::msg(msg))
            }
        }
    }
}

impl CostFunction for ArgminProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        Ok(self.point(param)?.map_or(PENALTY, |p| p.value))
    }
}

impl Gradient for ArgminProblem<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let Some(at) = self.point(param)? else {
            return Ok(vec![0.0; param.len()]);
        };
        match gradient(self.objective, &at) {
            Ok(g) => Ok(g.iter().copied().collect()),
            Err(_) => Ok(vec![0.0; param.len()]),
        }
    }
}

/// Result of an argmin run, or the best tracked point if it aborted.
fn finish(
    run: std::result::Result<(usize, bool), argmin::core::Error>,
    name: &str,
    counted: &Counted<'_>,
    best: RefCell<Option<ObjectivePoint>>,
    fatal: RefCell<Option<SsfError>>,
) -> Result<MinimizerOutcome> {
    if let Some(e) = fatal.into_inner() {
        return Err(e);
    }
    let (iterations, converged) = match run {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "{} stopped early", name);
            (0, false)
        }
    };
    let point = best
        .into_inner()
        .ok_or_else(|| SsfError::Optimizer(format!("{}: no admissible point evaluated", name)))?;
    Ok(MinimizerOutcome {
        point,
        converged,
        iterations,
        evaluations: counted.count(),
    })
}

fn is_converged(reason: Option<&TerminationReason>) -> bool {
    reason == Some(&TerminationReason::SolverConverged)
        || reason == Some(&TerminationReason::TargetCostReached)
}

/// argmin L-BFGS with a More-Thuente line search and a numerical gradient.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    settings: MinimizerSettings,
}

impl Lbfgs {
    pub fn new(settings: MinimizerSettings) -> Self {
        Self { settings }
    }
}

impl Minimizer for Lbfgs {
    fn kind(&self) -> MinimizerKind {
        MinimizerKind::Lbfgs
    }

    fn minimize(&self, objective: &dyn Objective, start: &DVector<f64>) -> Result<MinimizerOutcome> {
        let s = &self.settings;
        let counted = Counted::new(objective);
        let first = counted.evaluate(start)?;
        let init_params: Vec<f64> = first.parameters.iter().copied().collect();
        let best = RefCell::new(Some(first));
        let fatal = RefCell::new(None);

        let problem = ArgminProblem {
            objective: &counted,
            max_evaluations: s.max_evaluations,
            best: &best,
            fatal: &fatal,
        };
        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, s.lbfgs_memory)
            .with_tolerance_grad(s.gradient_tolerance)
            .map_err(|e| SsfError::Optimizer(e.to_string()))?
            .with_tolerance_cost(s.tolerance)
            .map_err(|e| SsfError::Optimizer(e.to_string()))?;

        let max_iters = s.max_iterations as u64;
        let run = Executor::new(problem, solver)
            .configure(
                |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                    state.param(init_params).max_iters(max_iters)
                },
            )
            .run()
            .map(|result| {
                let state = result.state();
                (state.get_iter() as usize, is_converged(state.get_termination_reason()))
            });

        finish(run, "L-BFGS", &counted, best, fatal)
    }
}

/// argmin Nelder-Mead started from a simplex of 5% perturbations.
#[derive(Debug, Clone)]
pub struct NelderMeadSimplex {
    settings: MinimizerSettings,
}

impl NelderMeadSimplex {
    pub fn new(settings: MinimizerSettings) -> Self {
        Self { settings }
    }
}

impl Minimizer for NelderMeadSimplex {
    fn kind(&self) -> MinimizerKind {
        MinimizerKind::NelderMead
    }

    fn minimize(&self, objective: &dyn Objective, start: &DVector<f64>) -> Result<MinimizerOutcome> {
        let s = &self.settings;
        let counted = Counted::new(objective);
        let first = counted.evaluate(start)?;
        let init_params: Vec<f64> = first.parameters.iter().copied().collect();
        let n = init_params.len();
        let best = RefCell::new(Some(first));
        let fatal = RefCell::new(None);

        let mut simplex = vec![init_params.clone()];
        for i in 0..n {
            let mut vertex = init_params.clone();
            let delta = if vertex[i].abs() > 1e-8 {
                vertex[i] * 0.05
            } else {
                0.00025
            };
            vertex[i] += delta;
            simplex.push(vertex);
        }

        let problem = ArgminProblem {
            objective: &counted,
            max_evaluations: s.max_evaluations,
            best: &best,
            fatal: &fatal,
        };
        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(s.tolerance)
            .map_err(|e| SsfError::Optimizer(e.to_string()))?;

        let max_iters = s.max_iterations as u64;
        let run = Executor::new(problem, solver)
            .configure(
                |state: argmin::core::IterState<Vec<f64>, (), (), (), (), f64>| {
                    state.max_iters(max_iters)
                },
            )
            .run()
            .map(|result| {
                let state = result.state();
                (state.get_iter() as usize, is_converged(state.get_termination_reason()))
            });

        finish(run, "Nelder-Mead", &counted, best, fatal)
    }
}
