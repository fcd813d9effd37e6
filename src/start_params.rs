//! Starting values for SARIMA coefficients.
//!
//! The series is gap-filled, differenced and cleaned of regression effects
//! by OLS; AR coefficients come from Burg (Yule-Walker as fallback), MA
//! coefficients from the innovations algorithm on the AR residuals. Every
//! polynomial is pulled inside the unit circle. Anything that cannot be
//! estimated starts at zero.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::polynomial::{ar_polynomial, differencing_polynomial, ma_polynomial, stabilize};
use crate::types::{ArimaOrder, Observations};

/// Largest inverse-root modulus of a starting polynomial.
const START_MAX_ROOT: f64 = 0.99;

/// Apply a lag polynomial, dropping the first `poly.len() - 1` values.
fn apply_polynomial(y: &[f64], poly: &[f64]) -> Vec<f64> {
    let k = poly.len().saturating_sub(1);
    if y.len() <= k {
        return vec![];
    }
    (k..y.len())
        .map(|t| poly.iter().enumerate().map(|(j, c)| c * y[t - j]).sum())
        .collect()
}

fn autocovariance(y: &[f64], k: usize) -> f64 {
    let n = y.len();
    if k >= n {
        return 0.0;
    }
    let mean: f64 = y.iter().sum::<f64>() / n as f64;
    let sum: f64 = (0..n - k).map(|i| (y[i] - mean) * (y[i + k] - mean)).sum();
    sum / n as f64
}

/// Burg's method; every stage is stable.
fn burg_ar(y: &[f64], p: usize) -> Option<Vec<f64>> {
    if p == 0 {
        return Some(vec![]);
    }
    let n = y.len();
    if n <= p {
        return None;
    }
    let mean: f64 = y.iter().sum::<f64>() / n as f64;
    let mut ef: Vec<f64> = y.iter().map(|&v| v - mean).collect();
    let mut eb: Vec<f64> = ef.clone();
    let mut a = vec![0.0; p];

    for k in 0..p {
        let mut num = 0.0;
        let mut den = 0.0;
        for t in (k + 1)..n {
            num += ef[t] * eb[t - 1];
            den += ef[t] * ef[t] + eb[t - 1] * eb[t - 1];
        }
        if den.abs() < 1e-15 {
            return None;
        }
        let kk = 2.0 * num / den;
        if kk.abs() >= 1.0 {
            return None;
        }

        let a_prev: Vec<f64> = a[..k].to_vec();
        a[k] = kk;
        for j in 0..k {
            a[j] = a_prev[j] - kk * a_prev[k - 1 - j];
        }
        // Backwards so eb[t - 1] is read before it is overwritten.
        for t in ((k + 1)..n).rev() {
            let ef_t = ef[t];
            ef[t] = ef_t - kk * eb[t - 1];
            eb[t] = eb[t - 1] - kk * ef_t;
        }
    }
    Some(a)
}

/// Levinson-Durbin on `gammas[0..=p]`, which may be taken at seasonal lags.
fn levinson(gammas: &[f64], p: usize) -> Option<Vec<f64>> {
    if p == 0 {
        return Some(vec![]);
    }
    if gammas.len() <= p || gammas[0].abs() < 1e-15 {
        return None;
    }
    let mut phi = vec![0.0; p];
    let mut var = gammas[0];
    for k in 0..p {
        let mut num = gammas[k + 1];
        for j in 0..k {
            num -= phi[j] * gammas[k - j];
        }
        if var.abs() < 1e-15 {
            return None;
        }
        let lambda = num / var;
        let prev = phi.clone();
        phi[k] = lambda;
        for j in 0..k {
            phi[j] = prev[j] - lambda * prev[k - 1 - j];
        }
        var *= 1.0 - lambda * lambda;
    }
    Some(phi)
}

fn yule_walker(y: &[f64], p: usize, lag: usize) -> Option<Vec<f64>> {
    if y.len() <= p * lag {
        return None;
    }
    let gammas: Vec<f64> = (0..=p).map(|k| autocovariance(y, k * lag)).collect();
    levinson(&gammas, p)
}

/// Innovations algorithm (Brockwell & Davis 5.2) on autocovariances at
/// multiples of `lag`.
fn innovations_ma(residuals: &[f64], q: usize, lag: usize) -> Vec<f64> {
    if q == 0 || residuals.len() <= q * lag {
        return vec![0.0; q];
    }
    let gamma: Vec<f64> = (0..=q).map(|k| autocovariance(residuals, k * lag)).collect();
    if gamma[0].abs() < 1e-15 {
        return vec![0.0; q];
    }
    let mut theta = vec![vec![0.0; q]; q + 1];
    let mut v = vec![0.0; q + 1];
    v[0] = gamma[0];
    for i in 1..=q {
        for k in 0..i {
            let mut sum = gamma[i - k];
            for j in 0..k {
                sum -= theta[k][k - 1 - j] * theta[i][i - 1 - j] * v[j];
            }
            theta[i][i - 1 - k] = if v[k].abs() > 1e-15 { sum / v[k] } else { 0.0 };
        }
        v[i] = gamma[0];
        for j in 0..i {
            v[i] -= theta[i][i - 1 - j].powi(2) * v[j];
        }
        v[i] = v[i].max(1e-15);
    }
    theta[q].iter().map(|c| c.clamp(-0.99, 0.99)).collect()
}

/// Residuals of `y_t - sum_j phi_j y_{t - (j+1) lag}`.
fn ar_residuals(y: &[f64], phi: &[f64], lag: usize) -> Vec<f64> {
    let start = phi.len() * lag;
    if y.len() <= start {
        return vec![];
    }
    (start..y.len())
        .map(|t| y[t] - phi.iter().enumerate().map(|(j, c)| c * y[t - (j + 1) * lag]).sum::<f64>())
        .collect()
}

/// OLS residuals of `w` on `x`; `w` unchanged when the fit fails.
fn remove_regression(w: Vec<f64>, x: &DMatrix<f64>) -> Vec<f64> {
    if x.ncols() == 0 || x.nrows() != w.len() || w.len() <= x.ncols() {
        return w;
    }
    let yv = DVector::from_vec(w);
    match x.clone().svd(true, true).solve(&yv, 1e-12) {
        Ok(beta) => (&yv - x * beta).iter().copied().collect(),
        Err(e) => {
            debug!(error = e, "start values: regression skipped");
            yv.iter().copied().collect()
        }
    }
}

fn stabilized(coefficients: Vec<f64>, ar: bool) -> Vec<f64> {
    let sign = if ar { -1.0 } else { 1.0 };
    let poly = if ar {
        ar_polynomial(&coefficients)
    } else {
        ma_polynomial(&coefficients)
    };
    match stabilize(&poly, START_MAX_ROOT) {
        Some(p) => p.iter().skip(1).map(|c| sign * c).collect(),
        None => coefficients,
    }
}

/// Starting coefficients `[ar | sar | ma | sma]` for `order`, given the
/// series and optional regressors (n x k, same rows as `y`).
pub fn start_parameters(y: &Observations, x: Option<&DMatrix<f64>>, order: &ArimaOrder) -> Vec<f64> {
    let (p, q, sp, sq, s) = (order.p, order.q, order.sp, order.sq, order.period);
    let delta = differencing_polynomial(order.d, order.sd, s);
    let mut w = apply_polynomial(&y.filled_forward(), &delta);
    if let Some(x) = x {
        let k = delta.len() - 1;
        let columns: Vec<Vec<f64>> = x
            .column_iter()
            .map(|c| apply_polynomial(c.as_slice(), &delta))
            .collect();
        if w.len() == y.len().saturating_sub(k) && columns.iter().all(|c| c.len() == w.len()) && !columns.is_empty() {
            let xd = DMatrix::from_fn(w.len(), columns.len(), |i, j| columns[j][i]);
            w = remove_regression(w, &xd);
        }
    }

    if w.len() < 3 {
        return vec![0.0; order.n_coefficients()];
    }

    let ar = burg_ar(&w, p)
        .or_else(|| yule_walker(&w, p, 1))
        .unwrap_or_else(|| vec![0.0; p]);
    let ar = stabilized(ar, true);
    let residuals = ar_residuals(&w, &ar, 1);

    let sar = if sp > 0 && s > 1 {
        yule_walker(&residuals, sp, s).unwrap_or_else(|| vec![0.0; sp])
    } else {
        vec![0.0; sp]
    };
    let sar = stabilized(sar, true);
    let residuals = if sp > 0 && s > 1 {
        ar_residuals(&residuals, &sar, s)
    } else {
        residuals
    };

    let ma = stabilized(innovations_ma(&residuals, q, 1), false);
    let sma = if s > 1 {
        stabilized(innovations_ma(&residuals, sq, s), false)
    } else {
        vec![0.0; sq]
    };

    let mut out = Vec::with_capacity(order.n_coefficients());
    out.extend(ar);
    out.extend(sar);
    out.extend(ma);
    out.extend(sma);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polynomial::is_stationary;

    /// AR(1) driven by an LCG with uniform shocks.
    fn ar1(phi: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut y = vec![0.0; n];
        let mut state = seed;
        for t in 1..n {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let u = (state >> 33) as f64 / (1u64 << 31) as f64 - 0.5;
            y[t] = phi * y[t - 1] + u;
        }
        y
    }

    #[test]
    fn test_apply_differencing_polynomial() {
        let y = [1.0, 3.0, 6.0, 10.0, 15.0];
        assert_eq!(apply_polynomial(&y, &[1.0, -1.0]), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(apply_polynomial(&y, &differencing_polynomial(2, 0, 0)), vec![1.0, 1.0, 1.0]);
        let s = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        assert_eq!(
            apply_polynomial(&s, &differencing_polynomial(0, 1, 4)),
            vec![4.0, 4.0, 4.0, 4.0]
        );
    }

    #[test]
    fn test_burg_ar1() {
        let y = ar1(0.7, 500, 42);
        let ar = burg_ar(&y, 1).unwrap();
        assert!((ar[0] - 0.7).abs() < 0.15, "Burg AR(1) estimate too far: {}", ar[0]);
    }

    #[test]
    fn test_yule_walker_ar1() {
        let y = ar1(0.7, 500, 42);
        let ar = yule_walker(&y, 1, 1).unwrap();
        assert!((ar[0] - 0.7).abs() < 0.15, "AR(1) estimate too far: {}", ar[0]);
    }

    #[test]
    fn test_burg_high_order_succeeds() {
        let y = ar1(0.95, 200, 123);
        assert!(burg_ar(&y, 8).is_some());
    }

    #[test]
    fn test_start_lengths_and_layout() {
        let y = Observations::new(
            (0..300)
                .map(|i| (i as f64 * 0.1).sin() + (i as f64 * 0.01).cos())
                .collect(),
        );
        let order = ArimaOrder::new(1, 1, 1, 1, 1, 1, 12);
        let start = start_parameters(&y, None, &order);
        assert_eq!(start.len(), 4);
        assert!(start.iter().all(|v| v.is_finite()));
        assert!(is_stationary(&ar_polynomial(&start[..1])));
    }

    #[test]
    fn test_short_series_starts_at_zero() {
        let y = Observations::new(vec![1.0, 2.0]);
        let start = start_parameters(&y, None, &ArimaOrder::arima(1, 1, 1));
        assert_eq!(start, vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_values_are_filled() {
        let mut values = ar1(0.6, 300, 7);
        values[10] = f64::NAN;
        values[11] = f64::NAN;
        let start = start_parameters(&Observations::new(values), None, &ArimaOrder::arma(1, 0));
        assert!((start[0] - 0.6).abs() < 0.2, "{}", start[0]);
    }

    #[test]
    fn test_regression_effect_removed() {
        let base = ar1(0.5, 400, 9);
        let x = DMatrix::from_fn(400, 1, |i, _| if i % 7 == 0 { 1.0 } else { 0.0 });
        let y: Vec<f64> = base.iter().enumerate().map(|(i, v)| v + 50.0 * x[(i, 0)]).collect();
        let start = start_parameters(&Observations::new(y), Some(&x), &ArimaOrder::arma(1, 0));
        assert!((start[0] - 0.5).abs() < 0.15, "{}", start[0]);
    }

    #[test]
    fn test_starting_polynomials_are_admissible() {
        let y = Observations::new(ar1(0.999, 300, 1));
        let start = start_parameters(&y, None, &ArimaOrder::arma(2, 2));
        assert!(is_stationary(&ar_polynomial(&start[..2])));
        assert!(is_stationary(&ma_polynomial(&start[2..])));
    }
}
