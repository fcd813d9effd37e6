use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use ssf_rs::arima::ArimaModel;
use ssf_rs::bsm::BsmModel;
use ssf_rs::components::SeasonalModel;
use ssf_rs::filter::filter;
use ssf_rs::likelihood::concentrated_likelihood;
use ssf_rs::mapping::SsfModel;
use ssf_rs::smoother::smooth;
use ssf_rs::types::{ArimaOrder, CovarianceForm, FilterOptions, LikelihoodOptions, Observations, StorageMode};

// ---------------------------------------------------------------------------
// Helpers: a monthly series with trend, seasonality and noise
// ---------------------------------------------------------------------------

fn monthly(n: usize) -> Observations {
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut level = 100.0;
    Observations::new(
        (0..n)
            .map(|t| {
                level += 0.2 + 0.5 * noise.sample(&mut rng);
                level + 5.0 * (2.0 * std::f64::consts::PI * t as f64 / 12.0).sin() + noise.sample(&mut rng)
            })
            .collect(),
    )
}

fn airline() -> ArimaModel {
    ArimaModel::new(ArimaOrder::airline(12), vec![-0.4, -0.6], 1.0).unwrap()
}

fn bsm() -> BsmModel {
    BsmModel {
        variances: [Some(0.3), Some(0.01), Some(0.05), None, Some(1.0)],
        seasonal_model: SeasonalModel::Trigonometric,
        period: 12,
        cycle_factor: 0.0,
        cycle_period: 0.0,
    }
}

// ---------------------------------------------------------------------------
// Filter forms
// ---------------------------------------------------------------------------

fn filter_forms(c: &mut Criterion) {
    let y = monthly(240);
    let model = airline().to_ssf().unwrap();
    let mut g = c.benchmark_group("filter_airline_240");
    for (name, form) in [("direct", CovarianceForm::Direct), ("square_root", CovarianceForm::SquareRoot)] {
        let options = FilterOptions {
            form,
            ..FilterOptions::default()
        };
        g.bench_function(name, |b| b.iter(|| filter(&model, std::hint::black_box(&y), &options).unwrap()));
    }
    g.finish();
}

fn filter_then_smooth(c: &mut Criterion) {
    let y = monthly(240).with_missing(&[17, 18, 100]);
    let model = bsm().to_ssf().unwrap();
    let mut g = c.benchmark_group("smooth_bsm_240");
    for (name, storage) in [("light", StorageMode::Light), ("full", StorageMode::Full)] {
        let options = FilterOptions {
            storage,
            ..FilterOptions::default()
        };
        g.bench_function(name, |b| {
            b.iter(|| {
                let output = filter(&model, std::hint::black_box(&y), &options).unwrap();
                smooth(&model, &output).unwrap()
            })
        });
    }
    g.finish();
}

// ---------------------------------------------------------------------------
// Concentrated likelihood with regression effects
// ---------------------------------------------------------------------------

fn likelihood_with_regressors(c: &mut Criterion) {
    let n = 240;
    let y = monthly(n);
    let mut rng = StdRng::seed_from_u64(7);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = DMatrix::from_fn(n, 6, |_, _| normal.sample(&mut rng));
    let model = airline().to_ssf().unwrap();
    let mut g = c.benchmark_group("likelihood_airline_6_regressors");
    for parallel in [false, true] {
        let options = LikelihoodOptions {
            parallel,
            ..LikelihoodOptions::default()
        };
        let name = if parallel { "parallel" } else { "sequential" };
        g.bench_function(name, |b| {
            b.iter(|| concentrated_likelihood(&model, std::hint::black_box(&y), Some(&x), &options).unwrap())
        });
    }
    g.finish();
}

criterion_group!(benches, filter_forms, filter_then_smooth, likelihood_with_regressors);
criterion_main!(benches);
