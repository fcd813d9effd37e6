//! Bounded transforms between natural model parameters and the free vector
//! seen by the optimizer.
//!
//! A [`ParameterBlock`] covers one architectural element (an AR polynomial,
//! a set of variances, ...). A [`CompositeMapping`] concatenates blocks and
//! removes fixed entries from the optimizer-visible vector. Model families
//! implement [`ParametricMapping`] on top of a composite.

use std::fmt;

use nalgebra::DVector;

use crate::composite::CompositeModel;
use crate::error::{Result, SsfError};
use crate::polynomial::{is_stationary, stabilize, MAX_INVERSE_ROOT};

/// Outcome of [`ParametricMapping::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValidation {
    Valid,
    /// Parameters were moved back into the admissible region.
    Changed,
    /// Parameters cannot be repaired.
    Invalid,
}

impl ParamValidation {
    fn merge(self, other: ParamValidation) -> ParamValidation {
        match (self, other) {
            (ParamValidation::Invalid, _) | (_, ParamValidation::Invalid) => ParamValidation::Invalid,
            (ParamValidation::Changed, _) | (_, ParamValidation::Changed) => ParamValidation::Changed,
            _ => ParamValidation::Valid,
        }
    }
}

/// A model that can be cast into state-space form.
pub trait SsfModel {
    fn to_ssf(&self) -> Result<CompositeModel>;
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// One element of a composite mapping. `repr` is the optimizer-side
/// representation of the block, `natural` the model-side values; both have
/// `len()` entries.
pub trait ParameterBlock: Send + Sync + fmt::Debug {
    fn len(&self) -> usize;

    fn to_natural(&self, repr: &[f64], natural: &mut [f64]);

    fn from_natural(&self, natural: &[f64], repr: &mut [f64]);

    fn lbound(&self, _i: usize) -> f64 {
        f64::NEG_INFINITY
    }

    fn ubound(&self, _i: usize) -> f64 {
        f64::INFINITY
    }

    /// Admissibility of a representation.
    fn check(&self, repr: &[f64]) -> bool {
        repr.iter()
            .enumerate()
            .all(|(i, &v)| v.is_finite() && v >= self.lbound(i) && v <= self.ubound(i))
    }

    /// Clamps into the box bounds.
    fn validate(&self, repr: &mut [f64]) -> ParamValidation {
        let mut status = ParamValidation::Valid;
        for (i, v) in repr.iter_mut().enumerate() {
            if !v.is_finite() {
                return ParamValidation::Invalid;
            }
            let clamped = v.clamp(self.lbound(i), self.ubound(i));
            if clamped != *v {
                *v = clamped;
                status = ParamValidation::Changed;
            }
        }
        status
    }

    /// Step for numerical derivatives.
    fn epsilon(&self, repr: &[f64], i: usize) -> f64 {
        (1e-4 * repr[i].abs()).max(1e-6)
    }

    /// Representation of a single natural value, when the block transforms
    /// its entries independently of each other.
    fn repr_of(&self, i: usize, natural: f64) -> Option<f64>;

    fn label(&self, i: usize) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolynomialKind {
    /// Coefficients of `1 - phi_1 L - ...`
    Ar,
    /// Coefficients of `1 + theta_1 L + ...`
    Ma,
}

/// AR or MA coefficients. With `enforce` the block uses the Monahan transform
/// and every representation is admissible; without it the raw coefficients
/// are optimized and validation reflects roots back into the unit circle.
#[derive(Debug, Clone)]
pub struct PolynomialBlock {
    name: &'static str,
    len: usize,
    kind: PolynomialKind,
    enforce: bool,
}

impl PolynomialBlock {
    pub fn new(name: &'static str, len: usize, kind: PolynomialKind, enforce: bool) -> Self {
        Self {
            name,
            len,
            kind,
            enforce,
        }
    }

    /// Sign of the coefficients in the lag polynomial: `1 - phi_1 L - ...`
    /// for AR, `1 + theta_1 L + ...` for MA.
    fn sign(&self) -> f64 {
        match self.kind {
            PolynomialKind::Ar => -1.0,
            PolynomialKind::Ma => 1.0,
        }
    }

    fn lag_polynomial(&self, coefficients: &[f64]) -> Vec<f64> {
        let sign = self.sign();
        std::iter::once(1.0)
            .chain(coefficients.iter().map(|c| sign * c))
            .collect()
    }

    /// Maps free values to the coefficients of a polynomial with all roots
    /// outside the unit circle (Monahan 1984, Jones 1980).
    ///
    /// Each value becomes a partial autocorrelation `r = -x / sqrt(1 + x^2)`
    /// and the Durbin-Levinson recursion builds the AR coefficients; MA
    /// coefficients are their negation.
    pub fn constrain(&self, repr: &[f64]) -> Vec<f64> {
        let mut phi: Vec<f64> = Vec::with_capacity(repr.len());
        for &x in repr {
            let r = -x / (1.0 + x * x).sqrt();
            let k = phi.len();
            let previous = phi.clone();
            for (i, c) in phi.iter_mut().enumerate() {
                *c -= r * previous[k - 1 - i];
            }
            phi.push(r);
        }
        let flip = -self.sign();
        phi.into_iter().map(|c| flip * c).collect()
    }

    /// Inverse of [`PolynomialBlock::constrain`], running the recursion
    /// downwards from the full order.
    pub fn unconstrain(&self, natural: &[f64]) -> Vec<f64> {
        let flip = -self.sign();
        let mut phi: Vec<f64> = natural.iter().map(|c| flip * c).collect();
        let mut repr = vec![0.0; phi.len()];
        while let Some(r) = phi.pop() {
            let denom = (1.0 - r * r).max(1e-15);
            repr[phi.len()] = -r / denom.sqrt();
            let upper = phi.clone();
            let k = upper.len();
            for (i, c) in phi.iter_mut().enumerate() {
                *c = (upper[i] + r * upper[k - 1 - i]) / denom;
            }
        }
        repr
    }
}

impl ParameterBlock for PolynomialBlock {
    fn len(&self) -> usize {
        self.len
    }

    fn to_natural(&self, repr: &[f64], natural: &mut [f64]) {
        if self.enforce {
            natural.copy_from_slice(&self.constrain(repr));
        } else {
            natural.copy_from_slice(repr);
        }
    }

    fn from_natural(&self, natural: &[f64], repr: &mut [f64]) {
        if self.enforce {
            repr.copy_from_slice(&self.unconstrain(natural));
        } else {
            repr.copy_from_slice(natural);
        }
    }

    fn check(&self, repr: &[f64]) -> bool {
        if !repr.iter().all(|v| v.is_finite()) {
            return false;
        }
        if self.enforce || self.kind == PolynomialKind::Ma {
            return true;
        }
        is_stationary(&self.lag_polynomial(repr))
    }

    fn validate(&self, repr: &mut [f64]) -> ParamValidation {
        if !repr.iter().all(|v| v.is_finite()) {
            return ParamValidation::Invalid;
        }
        if self.enforce {
            return ParamValidation::Valid;
        }
        match stabilize(&self.lag_polynomial(repr), MAX_INVERSE_ROOT) {
            None => ParamValidation::Valid,
            Some(p) => {
                let sign = match self.kind {
                    PolynomialKind::Ar => -1.0,
                    PolynomialKind::Ma => 1.0,
                };
                for (r, c) in repr.iter_mut().zip(p.iter().skip(1)) {
                    *r = sign * c;
                }
                ParamValidation::Changed
            }
        }
    }

    fn repr_of(&self, _i: usize, natural: f64) -> Option<f64> {
        if self.enforce {
            None
        } else {
            Some(natural)
        }
    }

    fn label(&self, i: usize) -> String {
        format!("{}[{}]", self.name, i + 1)
    }
}

/// Variances, represented by their square roots.
#[derive(Debug, Clone)]
pub struct VarianceBlock {
    labels: Vec<String>,
    max_variance: f64,
}

impl VarianceBlock {
    pub fn new(labels: Vec<String>, max_variance: f64) -> Self {
        Self {
            labels,
            max_variance,
        }
    }
}

impl ParameterBlock for VarianceBlock {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn to_natural(&self, repr: &[f64], natural: &mut [f64]) {
        for (n, r) in natural.iter_mut().zip(repr) {
            *n = r * r;
        }
    }

    fn from_natural(&self, natural: &[f64], repr: &mut [f64]) {
        for (r, n) in repr.iter_mut().zip(natural) {
            *r = n.max(0.0).sqrt();
        }
    }

    fn lbound(&self, _i: usize) -> f64 {
        -self.max_variance.sqrt()
    }

    fn ubound(&self, _i: usize) -> f64 {
        self.max_variance.sqrt()
    }

    fn repr_of(&self, _i: usize, natural: f64) -> Option<f64> {
        (natural >= 0.0).then(|| natural.sqrt())
    }

    fn label(&self, i: usize) -> String {
        self.labels[i].clone()
    }
}

/// Raw values inside a box.
#[derive(Debug, Clone)]
pub struct BoundedBlock {
    labels: Vec<String>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl BoundedBlock {
    pub fn new(labels: Vec<String>, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self {
            labels,
            lower,
            upper,
        }
    }
}

impl ParameterBlock for BoundedBlock {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn to_natural(&self, repr: &[f64], natural: &mut [f64]) {
        natural.copy_from_slice(repr);
    }

    fn from_natural(&self, natural: &[f64], repr: &mut [f64]) {
        repr.copy_from_slice(natural);
    }

    fn lbound(&self, i: usize) -> f64 {
        self.lower[i]
    }

    fn ubound(&self, i: usize) -> f64 {
        self.upper[i]
    }

    fn repr_of(&self, _i: usize, natural: f64) -> Option<f64> {
        Some(natural)
    }

    fn label(&self, i: usize) -> String {
        self.labels[i].clone()
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Concatenated blocks with optional fixed entries.
///
/// Indices into the natural vector are "global"; indices into the optimizer
/// vector skip the fixed entries.
#[derive(Debug)]
pub struct CompositeMapping {
    blocks: Vec<Box<dyn ParameterBlock>>,
    offsets: Vec<usize>,
    template: Vec<f64>,
    free: Vec<usize>,
    fixed: Vec<bool>,
}

impl CompositeMapping {
    pub fn new(blocks: Vec<Box<dyn ParameterBlock>>) -> Self {
        let mut offsets = vec![0];
        for b in &blocks {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + b.len());
        }
        let n = offsets[offsets.len() - 1];
        Self {
            blocks,
            offsets,
            template: vec![0.0; n],
            free: (0..n).collect(),
            fixed: vec![false; n],
        }
    }

    /// Length of the natural vector.
    pub fn natural_len(&self) -> usize {
        self.template.len()
    }

    pub fn dim(&self) -> usize {
        self.free.len()
    }

    fn locate(&self, global: usize) -> (usize, usize) {
        let b = self.offsets.partition_point(|&o| o <= global) - 1;
        (b, global - self.offsets[b])
    }

    /// Pin natural entry `global` to `value`. It leaves the optimizer vector.
    pub fn fix(&mut self, global: usize, value: f64) -> Result<()> {
        if global >= self.natural_len() {
            return Err(SsfError::DimensionMismatch {
                what: "fixed parameter index",
                expected: self.natural_len(),
                got: global,
            });
        }
        let (b, i) = self.locate(global);
        let repr = self.blocks[b].repr_of(i, value).ok_or_else(|| {
            SsfError::InvalidSpec(format!(
                "{} cannot be fixed individually to {}",
                self.blocks[b].label(i),
                value
            ))
        })?;
        self.template[global] = repr;
        if !self.fixed[global] {
            self.fixed[global] = true;
            self.free.retain(|&g| g != global);
        }
        Ok(())
    }

    pub fn is_fixed(&self, global: usize) -> bool {
        self.fixed[global]
    }

    /// Global index of optimizer entry `idx`.
    pub fn global_index(&self, idx: usize) -> usize {
        self.free[idx]
    }

    fn full_repr(&self, p: &DVector<f64>) -> Result<Vec<f64>> {
        if p.len() != self.dim() {
            return Err(SsfError::ParamLengthMismatch {
                expected: self.dim(),
                got: p.len(),
            });
        }
        let mut repr = self.template.clone();
        for (k, &g) in self.free.iter().enumerate() {
            repr[g] = p[k];
        }
        Ok(repr)
    }

    /// Natural values for an optimizer vector.
    pub fn to_natural(&self, p: &DVector<f64>) -> Result<Vec<f64>> {
        let repr = self.full_repr(p)?;
        let mut natural = vec![0.0; repr.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            let r = self.offsets[b]..self.offsets[b + 1];
            block.to_natural(&repr[r.clone()], &mut natural[r]);
        }
        Ok(natural)
    }

    /// Optimizer vector for natural values. Fixed entries are ignored.
    pub fn from_natural(&self, natural: &[f64]) -> Result<DVector<f64>> {
        if natural.len() != self.natural_len() {
            return Err(SsfError::ParamLengthMismatch {
                expected: self.natural_len(),
                got: natural.len(),
            });
        }
        let mut repr = vec![0.0; natural.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            let r = self.offsets[b]..self.offsets[b + 1];
            block.from_natural(&natural[r.clone()], &mut repr[r]);
        }
        Ok(DVector::from_iterator(
            self.free.len(),
            self.free.iter().map(|&g| repr[g]),
        ))
    }

    pub fn lbound(&self, idx: usize) -> f64 {
        let (b, i) = self.locate(self.free[idx]);
        self.blocks[b].lbound(i)
    }

    pub fn ubound(&self, idx: usize) -> f64 {
        let (b, i) = self.locate(self.free[idx]);
        self.blocks[b].ubound(i)
    }

    /// First inadmissible entry of `p`, reported as a boundary violation.
    pub fn violation(&self, p: &DVector<f64>) -> Result<Option<SsfError>> {
        let repr = self.full_repr(p)?;
        for (b, block) in self.blocks.iter().enumerate() {
            let r = self.offsets[b]..self.offsets[b + 1];
            if block.check(&repr[r.clone()]) {
                continue;
            }
            let local = (0..block.len())
                .find(|&i| {
                    let v = repr[r.start + i];
                    !v.is_finite() || v < block.lbound(i) || v > block.ubound(i)
                })
                .unwrap_or(0);
            let global = r.start + local;
            let index = self.free.iter().position(|&g| g == global).unwrap_or(global);
            return Ok(Some(SsfError::BoundaryViolation {
                index,
                value: repr[global],
                lower: block.lbound(local),
                upper: block.ubound(local),
            }));
        }
        Ok(None)
    }

    pub fn check_boundaries(&self, p: &DVector<f64>) -> bool {
        matches!(self.violation(p), Ok(None))
    }

    pub fn validate(&self, p: &mut DVector<f64>) -> ParamValidation {
        let mut repr = match self.full_repr(p) {
            Ok(r) => r,
            Err(_) => return ParamValidation::Invalid,
        };
        let mut status = ParamValidation::Valid;
        for (b, block) in self.blocks.iter().enumerate() {
            let r = self.offsets[b]..self.offsets[b + 1];
            status = status.merge(block.validate(&mut repr[r]));
        }
        if status == ParamValidation::Changed {
            let moved_fixed = (0..repr.len())
                .any(|g| self.fixed[g] && repr[g] != self.template[g]);
            if moved_fixed {
                return ParamValidation::Invalid;
            }
            for (k, &g) in self.free.iter().enumerate() {
                p[k] = repr[g];
            }
        }
        status
    }

    pub fn epsilon(&self, p: &DVector<f64>, idx: usize) -> f64 {
        let global = self.free[idx];
        let (b, i) = self.locate(global);
        let start = self.offsets[b];
        let mut local: Vec<f64> = self.template[start..self.offsets[b + 1]].to_vec();
        for (k, &g) in self.free.iter().enumerate() {
            if g >= start && g < self.offsets[b + 1] {
                local[g - start] = p[k];
            }
        }
        self.blocks[b].epsilon(&local, i)
    }

    /// Labels of the optimizer entries.
    pub fn labels(&self) -> Vec<String> {
        self.free
            .iter()
            .map(|&g| {
                let (b, i) = self.locate(g);
                self.blocks[b].label(i)
            })
            .collect()
    }
}

/// Model-level mapping used by the estimation routines.
pub trait ParametricMapping: Send + Sync {
    type Model: SsfModel + Clone + fmt::Debug + Send + Sync;

    fn blocks(&self) -> &CompositeMapping;

    fn map(&self, p: &DVector<f64>) -> Result<Self::Model>;

    /// Optimizer vector of a model (inverse of `map`).
    fn parameters(&self, model: &Self::Model) -> Result<DVector<f64>>;

    /// Starting point when the caller supplies none.
    fn default_parameters(&self) -> DVector<f64>;

    fn dim(&self) -> usize {
        self.blocks().dim()
    }

    fn lbound(&self, idx: usize) -> f64 {
        self.blocks().lbound(idx)
    }

    fn ubound(&self, idx: usize) -> f64 {
        self.blocks().ubound(idx)
    }

    fn check_boundaries(&self, p: &DVector<f64>) -> bool {
        self.blocks().check_boundaries(p)
    }

    fn validate(&self, p: &mut DVector<f64>) -> ParamValidation {
        self.blocks().validate(p)
    }

    fn epsilon(&self, p: &DVector<f64>, idx: usize) -> f64 {
        self.blocks().epsilon(p, idx)
    }
}
