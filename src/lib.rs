//! Linear Gaussian state-space models.
//!
//! Models are built from [`StateComponent`]s joined in a [`CompositeModel`].
//! The exact diffuse [`filter`] feeds the smoother, the concentrated
//! likelihood and forecasting; [`estimate`] maximizes the likelihood over
//! any [`ParametricMapping`], and [`BsmMonitor`] refines structural models.

pub mod error;
pub mod types;
pub mod polynomial;
pub mod linalg;
pub mod component;
pub mod components;
pub mod composite;
pub mod initialization;
pub mod mapping;
pub mod arima;
pub mod bsm;
pub mod filter;
pub mod smoother;
pub mod likelihood;
pub mod optimizer;
pub mod estimation;
pub mod start_params;
pub mod regarima;
pub mod forecast;
pub mod batch;

pub use crate::arima::{ArimaComponent, ArimaMapping, ArimaModel, ArimaSpec};
pub use crate::bsm::{BsmMapping, BsmModel, BsmSpec, ComponentUse, CycleSpec};
pub use crate::component::StateComponent;
pub use crate::components::{Cycle, LocalLevel, LocalLinearTrend, Noise, RegressionComponent, Seasonal, SeasonalModel};
pub use crate::composite::CompositeModel;
pub use crate::error::{ErrorKind, Result, SsfError};
pub use crate::estimation::{
    estimate, BsmEstimation, BsmMonitor, BsmMonitorConfig, EstimationConfig, EstimationResult,
};
pub use crate::filter::{filter, FilterOutput, StepKind};
pub use crate::forecast::{forecast, residuals, ForecastResult};
pub use crate::likelihood::{concentrated_likelihood, ConcentratedLikelihood, Likelihood};
pub use crate::mapping::{ParametricMapping, SsfModel};
pub use crate::optimizer::{MinimizerKind, MinimizerSettings};
pub use crate::regarima::{estimate_regarima, RegArimaEstimation, RegArimaSpec};
pub use crate::smoother::{smooth, SmoothedOutput};
pub use crate::types::{ArimaOrder, CovarianceForm, FilterOptions, LikelihoodOptions, Observations, StorageMode};

/// Crate version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
