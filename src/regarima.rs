//! Regression models with SARIMA errors.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::arima::{ArimaMapping, ArimaModel, ArimaSpec};
use crate::error::{Result, SsfError};
use crate::estimation::{estimate, EstimationConfig, EstimationResult};
use crate::likelihood::MissingEstimate;
use crate::mapping::ParametricMapping;
use crate::polynomial::{differencing_polynomial, integrated_constant};
use crate::start_params::start_parameters;
use crate::types::Observations;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegArimaSpec {
    pub arima: ArimaSpec,
    /// Adds the regressor whose differenced form is constant: the mean of
    /// a stationary model, the drift of an integrated one.
    pub mean: bool,
    /// Regressors, one column per variable, one row per observation.
    #[serde(skip)]
    pub regressors: Option<DMatrix<f64>>,
}

impl RegArimaSpec {
    pub fn new(arima: ArimaSpec) -> Self {
        Self {
            arima,
            mean: false,
            regressors: None,
        }
    }

    pub fn validate(&self, n: usize) -> Result<()> {
        self.arima.validate()?;
        if let Some(x) = &self.regressors {
            if x.nrows() != n {
                return Err(SsfError::DimensionMismatch {
                    what: "regressor rows",
                    expected: n,
                    got: x.nrows(),
                });
            }
        }
        Ok(())
    }

    /// Full design: the mean column first, then the regressors.
    pub fn design(&self, n: usize) -> Option<DMatrix<f64>> {
        let o = &self.arima.order;
        let mean = self
            .mean
            .then(|| integrated_constant(&differencing_polynomial(o.d, o.sd, o.period), n));
        let k = usize::from(mean.is_some()) + self.regressors.as_ref().map_or(0, |x| x.ncols());
        if k == 0 {
            return None;
        }
        let mut design = DMatrix::zeros(n, k);
        let mut col = 0;
        if let Some(m) = mean {
            design.column_mut(0).copy_from_slice(&m);
            col = 1;
        }
        if let Some(x) = &self.regressors {
            design.view_mut((0, col), (n, x.ncols())).copy_from(x);
        }
        Some(design)
    }

    fn labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if self.mean {
            labels.push("mean".to_string());
        }
        if let Some(x) = &self.regressors {
            labels.extend((1..=x.ncols()).map(|i| format!("x{}", i)));
        }
        labels
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionCoefficient {
    pub label: String,
    pub value: f64,
    pub standard_error: f64,
}

#[derive(Debug, Clone)]
pub struct RegArimaEstimation {
    pub result: EstimationResult<ArimaModel>,
    /// Estimated model with the innovation variance set to `sigma2`.
    pub model: ArimaModel,
    pub coefficients: Vec<RegressionCoefficient>,
    pub missing: Vec<MissingEstimate>,
    pub sigma2: f64,
    pub log_likelihood: f64,
    /// Free ARMA coefficients, regression coefficients and the variance.
    pub n_parameters: usize,
    pub aic: f64,
    pub bic: f64,
}

/// Maximum likelihood estimation of a regression model with SARIMA errors.
///
/// The regression coefficients and the innovation variance are concentrated
/// out; missing observations are estimated as additive outliers.
#[tracing::instrument(skip_all, fields(n = y.len(), mean = spec.mean))]
pub fn estimate_regarima(spec: &RegArimaSpec, y: &Observations, config: &EstimationConfig) -> Result<RegArimaEstimation> {
    spec.validate(y.len())?;
    let mapping = ArimaMapping::new(&spec.arima)?;
    let design = spec.design(y.len());

    let mut config = config.clone();
    config.likelihood.concentrate_scale = true;
    config.likelihood.missing_estimates = true;

    let mut natural = start_parameters(y, design.as_ref(), &spec.arima.order);
    for (v, fixed) in natural.iter_mut().zip(&spec.arima.fixed) {
        if let Some(f) = fixed {
            *v = *f;
        }
    }
    let start = mapping
        .blocks()
        .from_natural(&natural)
        .ok()
        .filter(|p| p.iter().all(|v| v.is_finite()));

    let result = match estimate(&mapping, y, design.as_ref(), start.as_ref(), &config) {
        Err(e) if e.is_recoverable() && start.is_some() => {
            debug!(error = %e, "starting values rejected, restarting from zero");
            estimate(&mapping, y, design.as_ref(), None, &config)?
        }
        other => other?,
    };

    let lk = &result.likelihood.likelihood;
    let sigma2 = lk.sigma2();
    let coefficients = match &result.likelihood.coefficients {
        Some(c) => {
            let se = c.standard_errors(sigma2);
            spec.labels()
                .into_iter()
                .enumerate()
                .map(|(i, label)| RegressionCoefficient {
                    label,
                    value: c.values[i],
                    standard_error: se[i],
                })
                .collect()
        }
        None => vec![],
    };
    let missing = result.likelihood.missing.clone().unwrap_or_default();
    let n_parameters = mapping.dim() + coefficients.len() + 1;
    let model = ArimaModel::new(
        spec.arima.order.clone(),
        result.model.coefficients.clone(),
        sigma2,
    )?;
    let log_likelihood = lk.log_likelihood();
    let aic = lk.aic(n_parameters);
    let bic = lk.bic(n_parameters);
    info!(log_likelihood, aic, bic, sigma2, "regarima estimated");

    Ok(RegArimaEstimation {
        model,
        coefficients,
        missing,
        sigma2,
        log_likelihood,
        n_parameters,
        aic,
        bic,
        result,
    })
}

/// Regression effects of an estimation, `X beta`, as a series.
pub fn regression_effects(spec: &RegArimaSpec, estimation: &RegArimaEstimation, n: usize) -> Option<DVector<f64>> {
    let design = spec.design(n)?;
    let beta = DVector::from_iterator(
        estimation.coefficients.len(),
        estimation.coefficients.iter().map(|c| c.value),
    );
    (design.ncols() == beta.len()).then(|| design * beta)
}
