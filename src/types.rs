use serde::{Deserialize, Serialize};

use crate::error::{Result, SsfError};

/// Univariate observation series. Non-finite values are treated as missing.
#[derive(Debug, Clone)]
pub struct Observations {
    values: Vec<f64>,
    missing: Vec<usize>,
}

impl Observations {
    pub fn new(values: Vec<f64>) -> Self {
        let values: Vec<f64> = values
            .into_iter()
            .map(|v| if v.is_finite() { v } else { f64::NAN })
            .collect();
        let missing = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_nan())
            .map(|(i, _)| i)
            .collect();
        Self { values, missing }
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values.to_vec())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw values, `NaN` at missing positions.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, t: usize) -> Option<f64> {
        self.values.get(t).copied().filter(|v| !v.is_nan())
    }

    /// True at missing positions and past the end of the series.
    pub fn is_missing(&self, t: usize) -> bool {
        self.get(t).is_none()
    }

    pub fn missing_positions(&self) -> &[usize] {
        &self.missing
    }

    pub fn n_observed(&self) -> usize {
        self.values.len() - self.missing.len()
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Copy of the series multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            values: self.values.iter().map(|v| v * factor).collect(),
            missing: self.missing.clone(),
        }
    }

    /// Copy of the series with the given positions marked missing.
    pub fn with_missing(&self, positions: &[usize]) -> Self {
        let mut values = self.values.clone();
        for &p in positions {
            if p < values.len() {
                values[p] = f64::NAN;
            }
        }
        Self::new(values)
    }

    /// Series with missing values replaced by the last observed value
    /// (or the first observed value for a leading gap).
    pub fn filled_forward(&self) -> Vec<f64> {
        let first = self.values.iter().copied().find(|v| !v.is_nan()).unwrap_or(0.0);
        let mut last = first;
        self.values
            .iter()
            .map(|&v| {
                if v.is_nan() {
                    last
                } else {
                    last = v;
                    v
                }
            })
            .collect()
    }
}

/// SARIMA order specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,      // AR order
    pub d: usize,      // differencing order
    pub q: usize,      // MA order
    pub sp: usize,     // seasonal AR order
    pub sd: usize,     // seasonal differencing order
    pub sq: usize,     // seasonal MA order
    pub period: usize, // seasonal period
}

impl ArimaOrder {
    pub fn new(p: usize, d: usize, q: usize, sp: usize, sd: usize, sq: usize, period: usize) -> Self {
        Self { p, d, q, sp, sd, sq, period }
    }

    pub fn arma(p: usize, q: usize) -> Self {
        Self::new(p, 0, q, 0, 0, 0, 0)
    }

    pub fn arima(p: usize, d: usize, q: usize) -> Self {
        Self::new(p, d, q, 0, 0, 0, 0)
    }

    /// The (0,1,1)(0,1,1) airline model.
    pub fn airline(period: usize) -> Self {
        Self::new(0, 1, 1, 0, 1, 1, period)
    }

    /// Extended AR order: p + s*P
    pub fn k_ar(&self) -> usize {
        self.p + self.period * self.sp
    }

    /// Extended MA order: q + s*Q
    pub fn k_ma(&self) -> usize {
        self.q + self.period * self.sq
    }

    /// ARMA block dimension: max(k_ar, k_ma + 1)
    pub fn k_order(&self) -> usize {
        std::cmp::max(self.k_ar(), self.k_ma() + 1)
    }

    /// Differencing state dimension: d + s*D
    pub fn k_states_diff(&self) -> usize {
        self.d + self.period * self.sd
    }

    pub fn k_states(&self) -> usize {
        self.k_order() + self.k_states_diff()
    }

    /// Number of AR/MA coefficients in natural layout `[ar | sar | ma | sma]`.
    pub fn n_coefficients(&self) -> usize {
        self.p + self.sp + self.q + self.sq
    }

    pub fn validate(&self) -> Result<()> {
        let seasonal = self.sp + self.sd + self.sq > 0;
        if seasonal && self.period < 2 {
            return Err(SsfError::InvalidSpec(format!(
                "seasonal terms require period >= 2, got {}",
                self.period
            )));
        }
        if self.sd > 1 {
            return Err(SsfError::InvalidSpec(
                "seasonal differencing order above 1 is not supported".into(),
            ));
        }
        Ok(())
    }
}

/// Covariance propagation used by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceForm {
    /// Propagate P directly.
    Direct,
    /// Propagate a factor L with P = LL'.
    SquareRoot,
    /// Direct form, switching to the square-root form at the first step
    /// where the updated covariance fails a Cholesky factorization.
    Auto,
}

/// What the filter retains per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// State means and gain vectors only.
    Light,
    /// Also the finite and diffuse covariance matrices.
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub form: CovarianceForm,
    pub storage: StorageMode,
    /// Fail with `NotObservable` when diffuse dimensions remain at the end.
    pub require_collapse: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            form: CovarianceForm::Auto,
            storage: StorageMode::Light,
            require_collapse: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodOptions {
    /// Profile the innovation variance out of the likelihood.
    pub concentrate_scale: bool,
    /// Keep the standardized residuals.
    pub residuals: bool,
    /// Estimate missing values as additive outliers.
    pub missing_estimates: bool,
    /// Filter regression columns on the rayon pool.
    pub parallel: bool,
    pub filter: FilterOptions,
}

impl Default for LikelihoodOptions {
    fn default() -> Self {
        Self {
            concentrate_scale: true,
            residuals: false,
            missing_estimates: false,
            parallel: false,
            filter: FilterOptions::default(),
        }
    }
}
