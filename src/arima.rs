//! SARIMA models in Harvey's state-space representation.
//!
//! State layout: `d` regular differencing states, `s*D` seasonal
//! differencing states, then the ARMA block of size
//! `max(p + s*P, q + s*Q + 1)`. The differencing states are diffuse, the
//! ARMA block starts from its stationary covariance.

use nalgebra::{DMatrix, DMatrixViewMut, DVector};
use serde::{Deserialize, Serialize};

use crate::component::StateComponent;
use crate::composite::CompositeModel;
use crate::error::{Result, SsfError};
use crate::initialization::stationary_covariance;
use crate::mapping::{
    CompositeMapping, ParameterBlock, ParametricMapping, PolynomialBlock, PolynomialKind, SsfModel,
};
use crate::polynomial::{
    ar_polynomial, ma_polynomial, polymul, seasonal_ar_polynomial, seasonal_ma_polynomial,
};
use crate::types::ArimaOrder;

#[derive(Debug, Clone)]
pub struct ArimaComponent {
    order: ArimaOrder,
    /// phi_i of the reduced AR polynomial, i = 1..k_order
    phi: Vec<f64>,
    /// R restricted to the ARMA block: [1, theta_1, ...]
    selection: Vec<f64>,
    variance: f64,
    /// Stationary covariance of the ARMA block.
    arma_covariance: DMatrix<f64>,
}

impl ArimaComponent {
    pub fn new(model: &ArimaModel) -> Result<Self> {
        let order = &model.order;
        order.validate()?;
        let s = order.period;
        let red_ar = polymul(
            &ar_polynomial(model.ar()),
            &seasonal_ar_polynomial(model.sar(), s.max(1)),
        );
        let red_ma = polymul(
            &ma_polynomial(model.ma()),
            &seasonal_ma_polynomial(model.sma(), s.max(1)),
        );
        let ko = order.k_order();
        let phi: Vec<f64> = (0..ko)
            .map(|i| red_ar.get(i + 1).map_or(0.0, |c| -c))
            .collect();
        let selection: Vec<f64> = (0..ko).map(|i| red_ma.get(i).copied().unwrap_or(0.0)).collect();

        let mut t = DMatrix::zeros(ko, ko);
        for i in 0..ko {
            t[(i, 0)] = phi[i];
            if i + 1 < ko {
                t[(i, i + 1)] = 1.0;
            }
        }
        let r = DMatrix::from_column_slice(ko, 1, &selection);
        let q = &r * r.transpose() * model.variance;
        let arma_covariance = stationary_covariance(&t, &q)?;

        Ok(Self {
            order: order.clone(),
            phi,
            selection,
            variance: model.variance,
            arma_covariance,
        })
    }

    pub fn order(&self) -> &ArimaOrder {
        &self.order
    }

    fn arma_start(&self) -> usize {
        self.order.k_states_diff()
    }
}

impl StateComponent for ArimaComponent {
    fn name(&self) -> &str {
        "arima"
    }

    fn dim(&self) -> usize {
        self.order.k_states()
    }

    fn diffuse_dim(&self) -> usize {
        self.order.k_states_diff()
    }

    fn initial_covariance(&self, mut pf0: DMatrixViewMut<'_, f64>, mut pi0: DMatrixViewMut<'_, f64>) {
        let sd = self.arma_start();
        let ko = self.order.k_order();
        pf0.view_mut((sd, sd), (ko, ko)).copy_from(&self.arma_covariance);
        for i in 0..sd {
            pi0[(i, i)] = 1.0;
        }
    }

    fn transition(&self, _t: usize, mut tm: DMatrixViewMut<'_, f64>) {
        let d = self.order.d;
        let s = self.order.period;
        let dd = self.order.sd;
        let sd = self.arma_start();
        let ko = self.order.k_order();

        for i in 0..d {
            for j in i..d {
                tm[(i, j)] = 1.0;
            }
        }
        for layer in 0..dd {
            let base = d + layer * s;
            tm[(base, base + s - 1)] = 1.0;
            for i in 0..(s - 1) {
                tm[(base + i + 1, base + i)] = 1.0;
            }
        }
        if dd > 0 {
            let last_seasonal = d + s * dd - 1;
            for i in 0..d {
                tm[(i, last_seasonal)] = 1.0;
            }
        }
        for i in 0..d {
            tm[(i, sd)] = 1.0;
        }
        for layer in 0..dd {
            tm[(d + layer * s, sd)] = 1.0;
        }
        for i in 0..ko {
            tm[(sd + i, sd)] = self.phi[i];
            if i + 1 < ko {
                tm[(sd + i, sd + i + 1)] = 1.0;
            }
        }
    }

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        let d = self.order.d;
        let s = self.order.period;
        let seasonal = self.order.sd > 0;
        let sd = self.arma_start();
        let ko = self.order.k_order();
        let head = x[sd];

        let last_seasonal = if seasonal { x[d + s - 1] } else { 0.0 };
        // regular differencing rows read only rows >= i, go top down
        for i in 0..d {
            let tail: f64 = x[i..d].iter().sum();
            x[i] = tail + last_seasonal + head;
        }
        if seasonal {
            x.copy_within(d..d + s - 1, d + 1);
            x[d] = last_seasonal + head;
        }
        for i in 0..ko {
            let next = if i + 1 < ko { x[sd + i + 1] } else { 0.0 };
            x[sd + i] = self.phi[i] * head + next;
        }
    }

    fn apply_transposed_transition(&self, _t: usize, x: &mut [f64]) {
        let d = self.order.d;
        let s = self.order.period;
        let seasonal = self.order.sd > 0;
        let sd = self.arma_start();
        let ko = self.order.k_order();

        let diff_sum: f64 = x[..d].iter().sum();
        let seasonal_head = if seasonal { x[d] } else { 0.0 };
        let arma_head: f64 = (0..ko).map(|i| self.phi[i] * x[sd + i]).sum();

        for i in (1..ko).rev() {
            x[sd + i] = x[sd + i - 1];
        }
        x[sd] = diff_sum + seasonal_head + arma_head;

        if seasonal {
            x.copy_within(d + 1..d + s, d);
            x[d + s - 1] = seasonal_head + diff_sum;
        }
        // column j of the differencing block collects rows 0..=j
        let mut acc = 0.0;
        for v in x[..d].iter_mut() {
            acc += *v;
            *v = acc;
        }
    }

    fn has_innovation(&self, _t: usize) -> bool {
        self.variance > 0.0
    }

    fn innovation_covariance(&self, _t: usize, mut v: DMatrixViewMut<'_, f64>) {
        let sd = self.arma_start();
        for (i, ri) in self.selection.iter().enumerate() {
            for (j, rj) in self.selection.iter().enumerate() {
                v[(sd + i, sd + j)] = self.variance * ri * rj;
            }
        }
    }

    fn innovation_factor(&self, _t: usize, mut f: DMatrixViewMut<'_, f64>) {
        let sd = self.arma_start();
        let scale = self.variance.max(0.0).sqrt();
        for (i, ri) in self.selection.iter().enumerate() {
            f[(sd + i, sd)] = scale * ri;
        }
    }

    fn loading(&self, _t: usize, z: &mut [f64]) {
        let d = self.order.d;
        for v in z[..d].iter_mut() {
            *v = 1.0;
        }
        for layer in 0..self.order.sd {
            z[d + (layer + 1) * self.order.period - 1] = 1.0;
        }
        z[self.arma_start()] = 1.0;
    }

    fn zx(&self, _t: usize, x: &[f64]) -> f64 {
        let d = self.order.d;
        let mut sum: f64 = x[..d].iter().sum();
        for layer in 0..self.order.sd {
            sum += x[d + (layer + 1) * self.order.period - 1];
        }
        sum + x[self.arma_start()]
    }
}

/// Natural SARIMA parameters: coefficients in `[ar | sar | ma | sma]` order
/// and the innovation variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArimaModel {
    pub order: ArimaOrder,
    pub coefficients: Vec<f64>,
    pub variance: f64,
}

impl ArimaModel {
    pub fn new(order: ArimaOrder, coefficients: Vec<f64>, variance: f64) -> Result<Self> {
        order.validate()?;
        if coefficients.len() != order.n_coefficients() {
            return Err(SsfError::ParamLengthMismatch {
                expected: order.n_coefficients(),
                got: coefficients.len(),
            });
        }
        if !(variance >= 0.0 && variance.is_finite()) {
            return Err(SsfError::InvalidSpec(format!(
                "innovation variance must be finite and non-negative, got {}",
                variance
            )));
        }
        Ok(Self {
            order,
            coefficients,
            variance,
        })
    }

    /// White noise with unit variance for the given order.
    pub fn null(order: ArimaOrder) -> Result<Self> {
        let n = order.n_coefficients();
        Self::new(order, vec![0.0; n], 1.0)
    }

    pub fn ar(&self) -> &[f64] {
        &self.coefficients[..self.order.p]
    }

    pub fn sar(&self) -> &[f64] {
        let start = self.order.p;
        &self.coefficients[start..start + self.order.sp]
    }

    pub fn ma(&self) -> &[f64] {
        let start = self.order.p + self.order.sp;
        &self.coefficients[start..start + self.order.q]
    }

    pub fn sma(&self) -> &[f64] {
        let start = self.order.p + self.order.sp + self.order.q;
        &self.coefficients[start..start + self.order.sq]
    }
}

impl SsfModel for ArimaModel {
    fn to_ssf(&self) -> Result<CompositeModel> {
        CompositeModel::single(Box::new(ArimaComponent::new(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArimaSpec {
    pub order: ArimaOrder,
    pub enforce_stationarity: bool,
    pub enforce_invertibility: bool,
    /// Per-coefficient fixed values in `[ar | sar | ma | sma]` order; empty
    /// means all free.
    #[serde(default)]
    pub fixed: Vec<Option<f64>>,
}

impl ArimaSpec {
    pub fn new(order: ArimaOrder) -> Self {
        Self {
            order,
            enforce_stationarity: false,
            enforce_invertibility: false,
            fixed: vec![],
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.order.validate()?;
        if !self.fixed.is_empty() && self.fixed.len() != self.order.n_coefficients() {
            return Err(SsfError::ParamLengthMismatch {
                expected: self.order.n_coefficients(),
                got: self.fixed.len(),
            });
        }
        Ok(())
    }
}

/// Optimizer view of the SARIMA coefficients. The innovation variance is
/// concentrated out and held at 1.
#[derive(Debug)]
pub struct ArimaMapping {
    order: ArimaOrder,
    blocks: CompositeMapping,
}

impl ArimaMapping {
    pub fn new(spec: &ArimaSpec) -> Result<Self> {
        spec.validate()?;
        let o = &spec.order;
        let parts: [(&'static str, usize, PolynomialKind, bool); 4] = [
            ("ar", o.p, PolynomialKind::Ar, spec.enforce_stationarity),
            ("sar", o.sp, PolynomialKind::Ar, spec.enforce_stationarity),
            ("ma", o.q, PolynomialKind::Ma, spec.enforce_invertibility),
            ("sma", o.sq, PolynomialKind::Ma, spec.enforce_invertibility),
        ];
        let blocks: Vec<Box<dyn ParameterBlock>> = parts
            .into_iter()
            .map(|(name, len, kind, enforce)| {
                Box::new(PolynomialBlock::new(name, len, kind, enforce)) as Box<dyn ParameterBlock>
            })
            .collect();
        let mut blocks = CompositeMapping::new(blocks);
        for (i, value) in spec.fixed.iter().enumerate() {
            if let Some(v) = value {
                blocks.fix(i, *v)?;
            }
        }
        Ok(Self {
            order: o.clone(),
            blocks,
        })
    }

    pub fn order(&self) -> &ArimaOrder {
        &self.order
    }
}

impl ParametricMapping for ArimaMapping {
    type Model = ArimaModel;

    fn blocks(&self) -> &CompositeMapping {
        &self.blocks
    }

    fn map(&self, p: &DVector<f64>) -> Result<ArimaModel> {
        let coefficients = self.blocks.to_natural(p)?;
        ArimaModel::new(self.order.clone(), coefficients, 1.0)
    }

    fn parameters(&self, model: &ArimaModel) -> Result<DVector<f64>> {
        self.blocks.from_natural(&model.coefficients)
    }

    fn default_parameters(&self) -> DVector<f64> {
        DVector::zeros(self.blocks.dim())
    }
}
