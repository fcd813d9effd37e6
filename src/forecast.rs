//! Out-of-sample forecasts and residual diagnostics from a filter pass.

use nalgebra::DMatrix;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::component::{innovation_matrix, loading_vector, transition_matrix, StateComponent};
use crate::error::{Result, SsfError};
use crate::filter::{filter, FilterOutput, StepKind};
use crate::linalg::symmetrize;
use crate::types::{FilterOptions, Observations};

/// Relative size of Z Pi Z' above which a forecast is still diffuse.
const DIFFUSE_TOL: f64 = 1e-9;

/// H-step ahead forecast result.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    /// Forecast means E[y(n+h)] for h = 1..steps.
    pub mean: Vec<f64>,
    /// Forecast variances. Infinite while a diffuse direction is unresolved.
    pub variance: Vec<f64>,
    pub ci_lower: Vec<f64>,
    pub ci_upper: Vec<f64>,
}

impl ForecastResult {
    fn with_capacity(steps: usize) -> Self {
        Self {
            mean: Vec::with_capacity(steps),
            variance: Vec::with_capacity(steps),
            ci_lower: Vec::with_capacity(steps),
            ci_upper: Vec::with_capacity(steps),
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

/// Residual diagnostics output.
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    /// Prediction errors; `NaN` where the step was not an ordinary update.
    pub residuals: Vec<f64>,
    /// e(t) / sqrt(F(t) * scale), `NaN` where the step was not an ordinary
    /// update.
    pub standardized_residuals: Vec<f64>,
}

/// Future regression effects: `design` (steps x k) times `coefficients`.
#[derive(Debug, Clone, Copy)]
pub struct FutureRegression<'a> {
    pub design: &'a DMatrix<f64>,
    pub coefficients: &'a [f64],
}

impl FutureRegression<'_> {
    fn effects(&self, steps: usize) -> Result<Vec<f64>> {
        if self.design.ncols() != self.coefficients.len() {
            return Err(SsfError::DimensionMismatch {
                what: "future regression columns",
                expected: self.coefficients.len(),
                got: self.design.ncols(),
            });
        }
        if self.design.nrows() < steps {
            return Err(SsfError::DimensionMismatch {
                what: "future regression rows",
                expected: steps,
                got: self.design.nrows(),
            });
        }
        Ok((0..steps)
            .map(|h| {
                self.design
                    .row(h)
                    .iter()
                    .zip(self.coefficients)
                    .map(|(x, b)| x * b)
                    .sum::<f64>()
            })
            .collect())
    }
}

/// Two-sided normal quantile for a `1 - alpha` interval.
fn interval_quantile(alpha: f64) -> Result<f64> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(SsfError::InvalidSpec(format!(
            "interval level alpha must lie in (0, 1), got {}",
            alpha
        )));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| SsfError::Numerical(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - alpha / 2.0))
}

/// Forecasts `steps` periods past the end of a filter pass.
///
/// Starting from a(n), P(n) of `output`:
///   y_hat(h) = Z a(h) + x(h) b
///   F(h)     = (Z P(h) Z' + h) * scale
///   a(h+1)   = T a(h)
///   P(h+1)   = T P(h) T' + V
///
/// `scale` multiplies the variances, for models filtered with the
/// innovation variance concentrated out.
pub fn forecast(
    model: &dyn StateComponent,
    output: &FilterOutput,
    steps: usize,
    alpha: f64,
    scale: f64,
    regression: Option<FutureRegression<'_>>,
) -> Result<ForecastResult> {
    let z_alpha = interval_quantile(alpha)?;
    if !(scale > 0.0 && scale.is_finite()) {
        return Err(SsfError::InvalidSpec(format!("forecast scale must be positive, got {}", scale)));
    }
    if output.final_state.len() != model.dim() {
        return Err(SsfError::DimensionMismatch {
            what: "filter output state",
            expected: model.dim(),
            got: output.final_state.len(),
        });
    }
    let effects = match regression {
        Some(r) => r.effects(steps)?,
        None => vec![0.0; steps],
    };

    let n = output.len();
    let mut a = output.final_state.clone();
    let mut p = output.final_covariance.clone();
    let mut pi = output.final_diffuse.clone();
    let mut result = ForecastResult::with_capacity(steps);

    for (h, effect) in effects.iter().enumerate() {
        let t = n + h;
        let z = loading_vector(model, t);
        let y_hat = model.zx(t, a.as_slice()) + effect;
        let f = (z.dot(&(&p * &z)) + model.measurement_variance(t)).max(0.0) * scale;
        let diffuse = pi.as_ref().is_some_and(|pi| {
            let fi = z.dot(&(pi * &z));
            let norm = pi.diagonal().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            fi > DIFFUSE_TOL * norm.max(1.0)
        });
        let variance = if diffuse { f64::INFINITY } else { f };
        let half_width = z_alpha * variance.sqrt();
        result.mean.push(y_hat);
        result.variance.push(variance);
        result.ci_lower.push(y_hat - half_width);
        result.ci_upper.push(y_hat + half_width);

        model.apply_transition(t, a.as_mut_slice());
        let tm = transition_matrix(model, t);
        p = &tm * &p * tm.transpose();
        if model.has_innovation(t) {
            p += innovation_matrix(model, t);
        }
        symmetrize(&mut p);
        pi = pi.map(|pi| &tm * pi * tm.transpose());
    }
    Ok(result)
}

/// Filters `y` under `model` and forecasts from the end of the sample.
pub fn forecast_series(
    model: &dyn StateComponent,
    y: &Observations,
    steps: usize,
    alpha: f64,
    scale: f64,
) -> Result<ForecastResult> {
    let options = FilterOptions {
        require_collapse: false,
        ..FilterOptions::default()
    };
    let output = filter(model, y, &options)?;
    forecast(model, &output, steps, alpha, scale, None)
}

/// Prediction errors and standardized residuals of a filter pass.
pub fn residuals(output: &FilterOutput, scale: f64) -> ResidualOutput {
    let (residuals, standardized_residuals) = output
        .steps
        .iter()
        .map(|s| match s.kind {
            StepKind::Ordinary => (s.e, s.e / (s.f * scale).sqrt()),
            StepKind::Missing | StepKind::Diffuse | StepKind::Degenerate => (f64::NAN, f64::NAN),
        })
        .unzip();
    ResidualOutput {
        residuals,
        standardized_residuals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arima::ArimaModel;
    use crate::components::{LocalLevel, Noise};
    use crate::composite::CompositeModel;
    use crate::mapping::SsfModel;
    use crate::types::ArimaOrder;
    use approx::assert_relative_eq;

    const PHI: f64 = 0.6527425084139002;

    fn ar1() -> CompositeModel {
        ArimaModel::new(ArimaOrder::arma(1, 0), vec![PHI], 1.0)
            .unwrap()
            .to_ssf()
            .unwrap()
    }

    fn local_level() -> CompositeModel {
        CompositeModel::new(vec![Box::new(LocalLevel::new(0.5)), Box::new(Noise::new(1.0))], 0.0).unwrap()
    }

    fn data() -> Observations {
        Observations::new(vec![0.3, -0.8, 1.1, 0.4, 2.0, 1.2, -0.5, 0.9])
    }

    #[test]
    fn test_forecast_ar1_mean_and_variance() {
        let model = ar1();
        let result = forecast_series(&model, &data(), 5, 0.05, 1.0).unwrap();
        assert_eq!(result.len(), 5);
        let last = 0.9;
        let mut expected_var = 0.0;
        for h in 0..5 {
            expected_var += PHI.powi(2 * h as i32);
            assert_relative_eq!(result.mean[h], PHI.powi(h as i32 + 1) * last, epsilon = 1e-10);
            assert_relative_eq!(result.variance[h], expected_var, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_forecast_ci_symmetric() {
        let model = ar1();
        let result = forecast_series(&model, &data(), 4, 0.05, 1.0).unwrap();
        for h in 0..4 {
            let lower = result.mean[h] - result.ci_lower[h];
            let upper = result.ci_upper[h] - result.mean[h];
            assert_relative_eq!(lower, upper, epsilon = 1e-12);
            assert_relative_eq!(upper, 1.959963984540054 * result.variance[h].sqrt(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_forecast_scale_and_regression() {
        let model = ar1();
        let output = filter(&model, &data(), &FilterOptions::default()).unwrap();
        let base = forecast(&model, &output, 3, 0.1, 1.0, None).unwrap();
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let coefficients = [2.0, 0.5];
        let regression = FutureRegression {
            design: &design,
            coefficients: &coefficients,
        };
        let shifted = forecast(&model, &output, 3, 0.1, 4.0, Some(regression)).unwrap();
        for h in 0..3 {
            assert_relative_eq!(shifted.mean[h], base.mean[h] + 2.0 + 0.5 * h as f64, epsilon = 1e-12);
            assert_relative_eq!(shifted.variance[h], 4.0 * base.variance[h], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_forecast_regression_rows_checked() {
        let model = ar1();
        let output = filter(&model, &data(), &FilterOptions::default()).unwrap();
        let design = DMatrix::zeros(2, 1);
        let regression = FutureRegression {
            design: &design,
            coefficients: &[1.0],
        };
        let err = forecast(&model, &output, 3, 0.05, 1.0, Some(regression)).unwrap_err();
        assert!(matches!(err, SsfError::DimensionMismatch { expected: 3, got: 2, .. }));
    }

    #[test]
    fn test_forecast_zero_steps_and_bad_alpha() {
        let model = ar1();
        assert!(forecast_series(&model, &data(), 0, 0.05, 1.0).unwrap().is_empty());
        assert!(matches!(
            forecast_series(&model, &data(), 2, 1.5, 1.0),
            Err(SsfError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_local_level_forecast_is_flat_with_growing_variance() {
        let model = local_level();
        let result = forecast_series(&model, &data(), 6, 0.05, 1.0).unwrap();
        for h in 1..6 {
            assert_relative_eq!(result.mean[h], result.mean[0], epsilon = 1e-12);
            assert_relative_eq!(result.variance[h] - result.variance[h - 1], 0.5, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_unresolved_diffuse_gives_infinite_variance() {
        let model = local_level();
        let y = Observations::new(vec![0.0; 3]).with_missing(&[0, 1, 2]);
        let result = forecast_series(&model, &y, 2, 0.05, 1.0).unwrap();
        assert!(result.variance.iter().all(|v| v.is_infinite()));
        assert!(result.ci_lower[0].is_infinite() && result.ci_lower[0] < 0.0);
        assert_eq!(result.mean, vec![0.0, 0.0]);
    }

    #[test]
    fn test_residuals_mark_non_ordinary_steps() {
        let model = local_level();
        let y = data().with_missing(&[3]);
        let output = filter(&model, &y, &FilterOptions::default()).unwrap();
        let res = residuals(&output, 1.0);
        assert_eq!(res.residuals.len(), y.len());
        assert!(res.standardized_residuals[0].is_nan());
        assert!(res.standardized_residuals[3].is_nan());
        let finite: Vec<f64> = res.standardized_residuals.iter().copied().filter(|v| v.is_finite()).collect();
        assert_eq!(finite, output.standardized_innovations());
        let halved = residuals(&output, 4.0);
        assert_relative_eq!(halved.standardized_residuals[1], 0.5 * res.standardized_residuals[1], epsilon = 1e-12);
    }
}
