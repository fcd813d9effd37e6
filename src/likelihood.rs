//! Concentrated likelihood: the diffuse filter, GLS on the standardized
//! innovations for regression effects, and optional additive-outlier
//! estimates of missing values.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

use crate::component::StateComponent;
use crate::error::{Result, SsfError};
use crate::filter::{filter, filter_column, FilterOutput};
use crate::types::{LikelihoodOptions, Observations};

/// Relative threshold on |R_ii| for the rank check of the regression design.
const RANK_TOL: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Likelihood {
    /// Number of observations contributing to ssq.
    pub n: usize,
    pub ssq: f64,
    pub log_determinant: f64,
    pub diffuse_correction: f64,
    /// Whether the scale is profiled out.
    pub concentrated: bool,
    /// Units of the data relative to the original series.
    pub scaling_factor: f64,
    pub residuals: Option<Vec<f64>>,
}

impl Likelihood {
    pub fn new(n: usize, ssq: f64, log_determinant: f64, diffuse_correction: f64, concentrated: bool) -> Self {
        Self {
            n,
            ssq,
            log_determinant,
            diffuse_correction,
            concentrated,
            scaling_factor: 1.0,
            residuals: None,
        }
    }

    pub fn log_likelihood(&self) -> f64 {
        let n = self.n as f64;
        if self.concentrated {
            -0.5 * (n * (2.0 * PI).ln() + n * (1.0 + (self.ssq / n).ln()) + self.log_determinant)
        } else {
            -0.5 * (n * (2.0 * PI).ln() + self.ssq + self.log_determinant)
        }
    }

    /// Log-likelihood including the diffuse term `-0.5 * sum ln F∞`.
    pub fn diffuse_log_likelihood(&self) -> f64 {
        self.log_likelihood() - 0.5 * self.diffuse_correction
    }

    /// Maximum-likelihood innovation variance (1 when not concentrated).
    pub fn sigma2(&self) -> f64 {
        if self.concentrated {
            self.ssq / self.n as f64
        } else {
            1.0
        }
    }

    /// `-2 LL + 2k`, with k the number of estimated parameters.
    pub fn aic(&self, k: usize) -> f64 {
        -2.0 * self.log_likelihood() + 2.0 * k as f64
    }

    pub fn bic(&self, k: usize) -> f64 {
        -2.0 * self.log_likelihood() + k as f64 * (self.n as f64).ln()
    }

    /// Re-expresses a likelihood computed on `c * y` in units of `c * y *
    /// factor`; `rescale(1/c)` gives the likelihood of `y`.
    pub fn rescale(&mut self, factor: f64) {
        self.ssq *= factor * factor;
        self.scaling_factor *= factor;
        if let Some(res) = self.residuals.as_mut() {
            for r in res.iter_mut() {
                *r *= factor;
            }
        }
    }

    /// Residuals whose sum of squares is `ssq * det^(1/n)`, the objective
    /// minimized by least-squares solvers. The determinant includes the
    /// diffuse part, so the minimum is the maximum of the concentrated
    /// `diffuse_log_likelihood`.
    pub fn least_squares_residuals(&self) -> Option<Vec<f64>> {
        let factor = ((self.log_determinant + self.diffuse_correction) / (2.0 * self.n as f64)).exp();
        self.residuals
            .as_ref()
            .map(|res| res.iter().map(|e| e * factor).collect())
    }
}

/// Regression coefficients from the GLS step.
#[derive(Debug, Clone)]
pub struct Coefficients {
    pub values: DVector<f64>,
    /// (X̃'X̃)⁻¹; multiply by σ² for the covariance.
    pub unscaled_covariance: DMatrix<f64>,
}

impl Coefficients {
    pub fn standard_errors(&self, sigma2: f64) -> DVector<f64> {
        self.unscaled_covariance
            .diagonal()
            .map(|v| (v * sigma2).max(0.0).sqrt())
    }
}

/// Estimate of a missing observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissingEstimate {
    pub position: usize,
    pub value: f64,
    pub variance: f64,
}

#[derive(Debug, Clone)]
pub struct ConcentratedLikelihood {
    pub likelihood: Likelihood,
    pub coefficients: Option<Coefficients>,
    pub missing: Option<Vec<MissingEstimate>>,
    pub filter: FilterOutput,
}

struct GlsSolution {
    beta: DVector<f64>,
    unscaled_covariance: DMatrix<f64>,
    residuals: Vec<f64>,
}

/// Least squares by QR with a rank check on the triangular factor.
fn gls(y: &[f64], columns: &[Vec<f64>]) -> Result<GlsSolution> {
    let n = y.len();
    let k = columns.len();
    if n < k {
        return Err(SsfError::RankDeficient { rank: n, columns: k });
    }
    let x = DMatrix::from_fn(n, k, |i, j| columns[j][i]);
    let qr = x.clone().qr();
    let r = qr.r();
    let scale = (0..k).map(|i| r[(i, i)].abs()).fold(0.0_f64, f64::max);
    let rank = (0..k)
        .filter(|&i| r[(i, i)].abs() > RANK_TOL * scale.max(f64::MIN_POSITIVE))
        .count();
    if rank < k {
        return Err(SsfError::RankDeficient { rank, columns: k });
    }
    let yv = DVector::from_column_slice(y);
    let qty = qr.q().tr_mul(&yv);
    let beta = r
        .solve_upper_triangular(&qty)
        .ok_or_else(|| SsfError::Numerical("singular triangular factor in GLS".into()))?;
    let r_inv = r
        .solve_upper_triangular(&DMatrix::identity(k, k))
        .ok_or_else(|| SsfError::Numerical("singular triangular factor in GLS".into()))?;
    let unscaled_covariance = &r_inv * r_inv.transpose();
    let fitted = &x * &beta;
    let residuals = yv.iter().zip(fitted.iter()).map(|(a, b)| a - b).collect();
    Ok(GlsSolution {
        beta,
        unscaled_covariance,
        residuals,
    })
}

fn transformed_columns(
    model: &dyn StateComponent,
    output: &FilterOutput,
    x: &DMatrix<f64>,
    parallel: bool,
) -> Vec<Vec<f64>> {
    let column = |j: usize| filter_column(model, output, x.column(j).as_slice());
    if parallel {
        (0..x.ncols()).into_par_iter().map(column).collect()
    } else {
        (0..x.ncols()).map(column).collect()
    }
}

/// Log-likelihood of `y` under `model`, with the regression effects `x`
/// (n x k) profiled out by GLS.
#[tracing::instrument(skip(model, y, x, options), fields(n = y.len(), k = x.map_or(0, |x| x.ncols())))]
pub fn concentrated_likelihood(
    model: &dyn StateComponent,
    y: &Observations,
    x: Option<&DMatrix<f64>>,
    options: &LikelihoodOptions,
) -> Result<ConcentratedLikelihood> {
    if let Some(x) = x {
        if x.nrows() != y.len() {
            return Err(SsfError::DimensionMismatch {
                what: "regression rows",
                expected: y.len(),
                got: x.nrows(),
            });
        }
    }
    let output = filter(model, y, &options.filter)?;
    if output.n_used == 0 {
        return Err(SsfError::NoObservations);
    }

    let (ssq, residuals, coefficients) = match x.filter(|x| x.ncols() > 0) {
        None => {
            let res = output.standardized_innovations();
            (output.ssq, res, None)
        }
        Some(x) => {
            let yt = output.standardized_innovations();
            let columns = transformed_columns(model, &output, x, options.parallel);
            let sol = gls(&yt, &columns)?;
            let ssq = sol.residuals.iter().map(|e| e * e).sum();
            (
                ssq,
                sol.residuals,
                Some(Coefficients {
                    values: sol.beta,
                    unscaled_covariance: sol.unscaled_covariance,
                }),
            )
        }
    };

    let mut likelihood = Likelihood::new(
        output.n_used,
        ssq,
        output.log_determinant,
        output.diffuse_correction,
        options.concentrate_scale,
    );
    if options.residuals {
        likelihood.residuals = Some(residuals);
    }

    let missing = if options.missing_estimates && y.has_missing() {
        Some(missing_values(model, y, x, likelihood.sigma2(), options)?)
    } else {
        None
    };

    debug!(n = likelihood.n, ssq = likelihood.ssq, ll = likelihood.log_likelihood(), "likelihood evaluated");
    Ok(ConcentratedLikelihood {
        likelihood,
        coefficients,
        missing,
        filter: output,
    })
}

/// Missing values as additive outliers: the series is completed with zeros
/// and one indicator column per gap joins the regression.
fn missing_values(
    model: &dyn StateComponent,
    y: &Observations,
    x: Option<&DMatrix<f64>>,
    sigma2: f64,
    options: &LikelihoodOptions,
) -> Result<Vec<MissingEstimate>> {
    let positions = y.missing_positions();
    let n = y.len();
    let filled = Observations::new(y.values().iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect());
    let output = filter(model, &filled, &options.filter)?;

    let k = x.map_or(0, |x| x.ncols());
    let mut design = DMatrix::zeros(n, k + positions.len());
    if let Some(x) = x {
        design.view_mut((0, 0), (n, k)).copy_from(x);
    }
    for (j, &p) in positions.iter().enumerate() {
        design[(p, k + j)] = 1.0;
    }

    let columns = transformed_columns(model, &output, &design, options.parallel);
    let sol = gls(&output.standardized_innovations(), &columns)?;
    Ok(positions
        .iter()
        .enumerate()
        .map(|(j, &p)| MissingEstimate {
            position: p,
            value: -sol.beta[k + j],
            variance: sigma2 * sol.unscaled_covariance[(k + j, k + j)],
        })
        .collect())
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

    fn series(n: usize) -> Vec<f64> {
        (0..n).map(|t| (t as f64 * 0.9).sin() + 0.3 * (t as f64 * 0.21).cos()).collect()
    }

    fn ar1(phi: f64) -> CompositeModel {
        ArimaModel::new(ArimaOrder::arma(1, 0), vec![phi], 1.0)
            .unwrap()
            .to_ssf()
            .unwrap()
    }

    #[test]
    fn test_concentrated_formula() {
        let lk = Likelihood::new(10, 20.0, 3.0, 0.0, true);
        let expected = -0.5 * (10.0 * (2.0 * PI).ln() + 10.0 * (1.0 + 2.0_f64.ln()) + 3.0);
        assert_relative_eq!(lk.log_likelihood(), expected, epsilon = 1e-12);
        assert_relative_eq!(lk.sigma2(), 2.0);
        let plain = Likelihood::new(10, 20.0, 3.0, 0.0, false);
        assert_relative_eq!(plain.log_likelihood(), -0.5 * (10.0 * (2.0 * PI).ln() + 23.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rescale_restores_units() {
        let m = ar1(0.5);
        let y = Observations::new(series(50));
        let opts = LikelihoodOptions::default();
        let base = concentrated_likelihood(&m, &y, None, &opts).unwrap().likelihood;
        let mut scaled = concentrated_likelihood(&m, &y.scaled(10.0), None, &opts).unwrap().likelihood;
        assert_relative_eq!(
            scaled.log_likelihood(),
            base.log_likelihood() - 50.0 * 10.0_f64.ln(),
            epsilon = 1e-9
        );
        scaled.rescale(0.1);
        assert_relative_eq!(scaled.log_likelihood(), base.log_likelihood(), epsilon = 1e-9);
    }

    #[test]
    fn test_mean_regression_recovers_offset() {
        let m = ar1(0.3);
        let raw = series(80);
        let y = Observations::new(raw.iter().map(|v| v + 5.0).collect());
        let x = DMatrix::from_element(80, 1, 1.0);
        let with = concentrated_likelihood(&m, &y, Some(&x), &LikelihoodOptions::default()).unwrap();
        let beta = with.coefficients.unwrap().values[0];
        assert!((beta - 5.0).abs() < 0.2, "{}", beta);
        let without = concentrated_likelihood(&m, &y, None, &LikelihoodOptions::default()).unwrap();
        assert!(with.likelihood.ssq < without.likelihood.ssq);
    }

    #[test]
    fn test_parallel_columns_match_sequential() {
        let m = ar1(0.6);
        let y = Observations::new(series(40));
        let x = DMatrix::from_fn(40, 3, |i, j| ((i * (j + 1)) as f64 * 0.37).sin());
        let seq = concentrated_likelihood(&m, &y, Some(&x), &LikelihoodOptions::default()).unwrap();
        let opts = LikelihoodOptions {
            parallel: true,
            ..LikelihoodOptions::default()
        };
        let par = concentrated_likelihood(&m, &y, Some(&x), &opts).unwrap();
        assert_relative_eq!(seq.likelihood.ssq, par.likelihood.ssq, epsilon = 1e-12);
    }

    #[test]
    fn test_rank_deficient_design_is_structural() {
        let m = ar1(0.6);
        let y = Observations::new(series(30));
        let x = DMatrix::from_fn(30, 2, |i, _| i as f64);
        let err = concentrated_likelihood(&m, &y, Some(&x), &LikelihoodOptions::default()).unwrap_err();
        assert!(matches!(err, SsfError::RankDeficient { rank: 1, columns: 2 }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_no_observations() {
        let m = ar1(0.6);
        let y = Observations::new(vec![f64::NAN; 4]);
        let err = concentrated_likelihood(&m, &y, None, &LikelihoodOptions::default()).unwrap_err();
        assert!(matches!(err, SsfError::NoObservations));
    }

    #[test]
    fn test_missing_value_of_smooth_series() {
        // nearly noiseless random walk: the gap is filled with the mean of its neighbours
        let m = CompositeModel::new(vec![Box::new(LocalLevel::new(1.0)), Box::new(Noise::new(0.01))], 0.0)
            .unwrap();
        let y = Observations::from_slice(&[1.0, 1.2, 1.1, 1.3, 1.4, 1.2, 1.5, 1.6]).with_missing(&[4]);
        let opts = LikelihoodOptions {
            missing_estimates: true,
            ..LikelihoodOptions::default()
        };
        let lk = concentrated_likelihood(&m, &y, None, &opts).unwrap();
        let est = lk.missing.unwrap()[0];
        assert_eq!(est.position, 4);
        assert!((est.value - 1.25).abs() < 0.01, "{}", est.value);
        assert!(est.variance > 0.0);
    }

    #[test]
    fn test_least_squares_residuals_reproduce_objective() {
        let m = ar1(0.4);
        let y = Observations::new(series(30));
        let opts = LikelihoodOptions {
            residuals: true,
            ..LikelihoodOptions::default()
        };
        let lk = concentrated_likelihood(&m, &y, None, &opts).unwrap().likelihood;
        let res = lk.least_squares_residuals().unwrap();
        let obj: f64 = res.iter().map(|e| e * e).sum();
        let n = lk.n as f64;
        assert_relative_eq!(obj, lk.ssq * (lk.log_determinant / n).exp(), max_relative = 1e-12);
    }
}
