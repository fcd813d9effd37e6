//! Rayon-based parallel batch processing for multiple time series.
//!
//! Each series is handled independently on the work-stealing pool; results
//! come back in input order, one `Result` per series.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{Result, SsfError};
use crate::estimation::{estimate, EstimationConfig, EstimationResult};
use crate::forecast::{forecast_series, ForecastResult};
use crate::likelihood::concentrated_likelihood;
use crate::mapping::{ParametricMapping, SsfModel};
use crate::regarima::{estimate_regarima, RegArimaEstimation, RegArimaSpec};
use crate::types::{LikelihoodOptions, Observations};

/// Log-likelihood of several series under one model.
///
/// `regressors[i]`, when given, is the design of `series[i]`.
pub fn batch_log_likelihood<M: SsfModel + Sync>(
    model: &M,
    series: &[Observations],
    regressors: Option<&[DMatrix<f64>]>,
    options: &LikelihoodOptions,
) -> Vec<Result<f64>> {
    let ssf = match model.to_ssf() {
        Ok(ssf) => ssf,
        Err(e) => return series.iter().map(|_| Err(e.clone())).collect(),
    };
    series
        .par_iter()
        .enumerate()
        .map(|(i, y)| {
            let x = regressors.map(|r| design_of(r, i)).transpose()?;
            let lk = concentrated_likelihood(&ssf, y, x, options)?;
            Ok(lk.likelihood.log_likelihood())
        })
        .collect()
}

/// Fits the same mapping to several series.
pub fn batch_estimate<M: ParametricMapping>(
    mapping: &M,
    series: &[Observations],
    config: &EstimationConfig,
) -> Vec<Result<EstimationResult<M::Model>>> {
    series
        .par_iter()
        .map(|y| estimate(mapping, y, None, None, config))
        .collect()
}

/// Fits a regression model with SARIMA errors to several series.
pub fn batch_regarima(
    spec: &RegArimaSpec,
    series: &[Observations],
    config: &EstimationConfig,
) -> Vec<Result<RegArimaEstimation>> {
    series
        .par_iter()
        .map(|y| estimate_regarima(spec, y, config))
        .collect()
}

/// Forecasts each series under its own model: `models[i]` for `series[i]`.
pub fn batch_forecast<M: SsfModel + Sync>(
    models: &[M],
    series: &[Observations],
    steps: usize,
    alpha: f64,
) -> Vec<Result<ForecastResult>> {
    series
        .par_iter()
        .enumerate()
        .map(|(i, y)| {
            let model = models.get(i).ok_or(SsfError::DimensionMismatch {
                what: "batch models",
                expected: series.len(),
                got: models.len(),
            })?;
            let ssf = model.to_ssf()?;
            forecast_series(&ssf, y, steps, alpha, 1.0)
        })
        .collect()
}

fn design_of(regressors: &[DMatrix<f64>], i: usize) -> Result<&DMatrix<f64>> {
    regressors.get(i).ok_or(SsfError::DimensionMismatch {
        what: "batch regressors",
        expected: i + 1,
        got: regressors.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arima::{ArimaMapping, ArimaModel, ArimaSpec};
    use crate::types::ArimaOrder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn ar1_series(phi: f64, n: usize, seed: u64) -> Observations {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut x = 0.0;
        Observations::new(
            (0..n)
                .map(|_| {
                    x = phi * x + normal.sample(&mut rng);
                    x
                })
                .collect(),
        )
    }

    fn ar1_model(phi: f64) -> ArimaModel {
        ArimaModel::new(ArimaOrder::arma(1, 0), vec![phi], 1.0).unwrap()
    }

    #[test]
    fn test_batch_log_likelihood_matches_single() {
        let model = ar1_model(0.6);
        let series = vec![ar1_series(0.6, 80, 1), ar1_series(0.6, 60, 2)];
        let options = LikelihoodOptions::default();
        let batch = batch_log_likelihood(&model, &series, None, &options);
        assert_eq!(batch.len(), 2);
        let ssf = model.to_ssf().unwrap();
        for (y, r) in series.iter().zip(&batch) {
            let direct = concentrated_likelihood(&ssf, y, None, &options)
                .unwrap()
                .likelihood
                .log_likelihood();
            assert_eq!(*r.as_ref().unwrap(), direct);
        }
    }

    #[test]
    fn test_batch_log_likelihood_missing_design() {
        let model = ar1_model(0.6);
        let series = vec![ar1_series(0.6, 30, 1), ar1_series(0.6, 30, 2)];
        let designs = vec![DMatrix::from_element(30, 1, 1.0)];
        let batch = batch_log_likelihood(&model, &series, Some(&designs), &LikelihoodOptions::default());
        assert!(batch[0].is_ok());
        assert!(matches!(batch[1], Err(SsfError::DimensionMismatch { got: 1, .. })));
    }

    #[test]
    fn test_batch_estimate_matches_single() {
        let mapping = ArimaMapping::new(&ArimaSpec::new(ArimaOrder::arma(1, 0))).unwrap();
        let config = EstimationConfig::default();
        let series: Vec<Observations> = (0..4).map(|s| ar1_series(0.5, 100, 30 + s)).collect();
        let batch = batch_estimate(&mapping, &series, &config);
        assert_eq!(batch.len(), 4);
        let direct = estimate(&mapping, &series[2], None, None, &config).unwrap();
        let from_batch = batch[2].as_ref().unwrap();
        assert_eq!(from_batch.parameters, direct.parameters);
        assert_eq!(from_batch.log_likelihood(), direct.log_likelihood());
        assert!(batch.iter().all(|r| r.as_ref().is_ok_and(|e| e.converged)));
    }

    #[test]
    fn test_batch_regarima_error_handling() {
        let spec = RegArimaSpec::new(ArimaSpec::new(ArimaOrder::arma(1, 0)));
        let series = vec![ar1_series(0.5, 120, 5), Observations::new(vec![])];
        let results = batch_regarima(&spec, &series, &EstimationConfig::default());
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_batch_forecast_matches_single() {
        let models = vec![ar1_model(0.6), ar1_model(-0.3)];
        let series = vec![ar1_series(0.6, 50, 3), ar1_series(-0.3, 50, 4)];
        let batch = batch_forecast(&models, &series, 5, 0.05);
        for (i, r) in batch.iter().enumerate() {
            let ssf = models[i].to_ssf().unwrap();
            let direct = forecast_series(&ssf, &series[i], 5, 0.05, 1.0).unwrap();
            assert_eq!(r.as_ref().unwrap().mean, direct.mean);
            assert_eq!(r.as_ref().unwrap().variance, direct.variance);
        }
    }

    #[test]
    fn test_batch_forecast_needs_a_model_per_series() {
        let models = vec![ar1_model(0.6)];
        let series = vec![ar1_series(0.6, 20, 3), ar1_series(0.6, 20, 4)];
        let batch = batch_forecast(&models, &series, 2, 0.05);
        assert!(batch[0].is_ok());
        assert!(matches!(batch[1], Err(SsfError::DimensionMismatch { expected: 2, got: 1, .. })));
    }

    #[test]
    fn test_batch_empty() {
        let mapping = ArimaMapping::new(&ArimaSpec::new(ArimaOrder::arma(1, 0))).unwrap();
        assert!(batch_estimate(&mapping, &[], &EstimationConfig::default()).is_empty());
    }
}
