//! Lag polynomials in the backshift operator, stored lowest degree first.

use nalgebra::{Complex, DMatrix};

/// Inverse roots above this modulus are treated as non-stationary.
pub const MAX_INVERSE_ROOT: f64 = 1.0 - 1e-6;

/// Polynomial multiplication (convolution): c[k] = sum_i a[i]*b[k-i].
pub fn polymul(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return vec![];
    }
    let mut r = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            r[i + j] += ai * bj;
        }
    }
    r
}

/// AR polynomial: 1 - phi_1*L - phi_2*L^2 - ...
pub fn ar_polynomial(phi: &[f64]) -> Vec<f64> {
    seasonal_ar_polynomial(phi, 1)
}

/// Seasonal AR polynomial: 1 - Phi_1*L^s - Phi_2*L^(2s) - ...
pub fn seasonal_ar_polynomial(phi: &[f64], s: usize) -> Vec<f64> {
    let mut p = vec![0.0; phi.len() * s + 1];
    p[0] = 1.0;
    for (i, &c) in phi.iter().enumerate() {
        p[(i + 1) * s] = -c;
    }
    p
}

/// MA polynomial: 1 + theta_1*L + theta_2*L^2 + ...
pub fn ma_polynomial(theta: &[f64]) -> Vec<f64> {
    seasonal_ma_polynomial(theta, 1)
}

/// Seasonal MA polynomial: 1 + Theta_1*L^s + Theta_2*L^(2s) + ...
pub fn seasonal_ma_polynomial(theta: &[f64], s: usize) -> Vec<f64> {
    let mut p = vec![0.0; theta.len() * s + 1];
    p[0] = 1.0;
    for (i, &c) in theta.iter().enumerate() {
        p[(i + 1) * s] = c;
    }
    p
}

/// (1 - L)^d (1 - L^s)^D
pub fn differencing_polynomial(d: usize, sd: usize, s: usize) -> Vec<f64> {
    let mut p = vec![1.0];
    for _ in 0..d {
        p = polymul(&p, &[1.0, -1.0]);
    }
    if s > 0 {
        let mut seasonal = vec![0.0; s + 1];
        seasonal[0] = 1.0;
        seasonal[s] = -1.0;
        for _ in 0..sd {
            p = polymul(&p, &seasonal);
        }
    }
    p
}

/// Solution of `poly(L) x_t = 1` with `x_t = 0` for `t < 0`.
///
/// For a differencing polynomial this is the regressor whose differenced
/// version is the constant 1.
pub fn integrated_constant(poly: &[f64], n: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    let c0 = poly.first().copied().unwrap_or(1.0);
    for t in 0..n {
        let mut acc = 1.0;
        for (j, &c) in poly.iter().enumerate().skip(1) {
            if j > t {
                break;
            }
            acc -= c * x[t - j];
        }
        x[t] = acc / c0;
    }
    x
}

/// Roots of `c[0] + c[1] z + ... + c[n] z^n`, via the companion matrix.
pub fn roots(c: &[f64]) -> Vec<Complex<f64>> {
    let degree = match c.iter().rposition(|v| *v != 0.0) {
        Some(d) if d > 0 => d,
        _ => return vec![],
    };
    let lead = c[degree];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }
    for i in 0..degree {
        companion[(i, degree - 1)] = -c[i] / lead;
    }
    companion.complex_eigenvalues().iter().copied().collect()
}

/// Inverse roots `1/r` of a polynomial with `c[0] = 1`. The process
/// `c(L) x_t = e_t` is stationary when all of them lie inside the unit circle.
pub fn inverse_roots(c: &[f64]) -> Vec<Complex<f64>> {
    roots(c)
        .into_iter()
        .map(|r| Complex::new(1.0, 0.0) / r)
        .collect()
}

pub fn is_stationary(c: &[f64]) -> bool {
    inverse_roots(c).iter().all(|w| w.norm() < MAX_INVERSE_ROOT)
}

/// Polynomial `prod_i (1 - w_i z)` from its inverse roots (real part).
pub fn from_inverse_roots(w: &[Complex<f64>]) -> Vec<f64> {
    let mut p = vec![Complex::new(1.0, 0.0)];
    for &wi in w {
        let mut next = vec![Complex::new(0.0, 0.0); p.len() + 1];
        for (k, &pk) in p.iter().enumerate() {
            next[k] += pk;
            next[k + 1] -= pk * wi;
        }
        p = next;
    }
    p.into_iter().map(|c| c.re).collect()
}

/// Moves inverse roots outside the admissible disc back inside: roots
/// beyond the unit circle are reflected, then any root still above
/// `max_modulus` is shrunk onto it. Returns `None` when nothing changed.
pub fn stabilize(c: &[f64], max_modulus: f64) -> Option<Vec<f64>> {
    let mut w = inverse_roots(c);
    let mut changed = false;
    for wi in w.iter_mut() {
        let m = wi.norm();
        if m >= max_modulus {
            changed = true;
            if m > 1.0 {
                *wi = *wi / (m * m);
            }
            let m = wi.norm();
            if m > max_modulus {
                *wi = *wi * (max_modulus / m);
            }
        }
    }
    if !changed {
        return None;
    }
    let mut p = from_inverse_roots(&w);
    p.resize(c.len(), 0.0);
    Some(p)
}
