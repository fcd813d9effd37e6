//! Maximum likelihood estimation over a `ParametricMapping`, and the
//! monitor that refines structural models by collapsing negligible
//! variances and switching the anchor.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bsm::{BsmMapping, BsmModel, BsmSpec, ComponentUse, SLOT_NAMES};
use crate::error::{Result, SsfError};
use crate::likelihood::{concentrated_likelihood, ConcentratedLikelihood};
use crate::mapping::{ParamValidation, ParametricMapping, SsfModel};
use crate::optimizer::{self, MinimizerKind, MinimizerSettings, Objective, ObjectivePoint};
use crate::types::{LikelihoodOptions, Observations};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfig {
    pub minimizer: MinimizerKind,
    pub settings: MinimizerSettings,
    /// Options of the final evaluation. During the search residuals are
    /// kept only for least-squares solvers and missing values are skipped.
    pub likelihood: LikelihoodOptions,
    /// Numerical derivatives on the rayon pool.
    pub parallel: bool,
    pub compute_hessian: bool,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            minimizer: MinimizerKind::LevenbergMarquardt,
            settings: MinimizerSettings::default(),
            likelihood: LikelihoodOptions::default(),
            parallel: false,
            compute_hessian: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimationResult<M> {
    /// Optimizer vector at the optimum.
    pub parameters: DVector<f64>,
    pub model: M,
    pub likelihood: ConcentratedLikelihood,
    pub converged: bool,
    /// Gradient of `-log L` at the optimum.
    pub gradient: Option<DVector<f64>>,
    /// Hessian of `-log L` at the optimum.
    pub hessian: Option<DMatrix<f64>>,
    pub iterations: usize,
    pub evaluations: usize,
}

impl<M> EstimationResult<M> {
    pub fn log_likelihood(&self) -> f64 {
        self.likelihood.likelihood.diffuse_log_likelihood()
    }

    /// Standard errors of the optimizer vector from the inverse Hessian.
    pub fn standard_errors(&self) -> Option<DVector<f64>> {
        let h = self.hessian.as_ref()?;
        let inv = h.clone().cholesky()?.inverse();
        Some(inv.diagonal().map(|v| v.max(0.0).sqrt()))
    }
}

/// `-log L` of a mapped model, with the least-squares form when requested.
pub struct LikelihoodObjective<'a, M: ParametricMapping> {
    mapping: &'a M,
    y: &'a Observations,
    x: Option<&'a DMatrix<f64>>,
    options: LikelihoodOptions,
    parallel: bool,
}

impl<'a, M: ParametricMapping> LikelihoodObjective<'a, M> {
    pub fn new(
        mapping: &'a M,
        y: &'a Observations,
        x: Option<&'a DMatrix<f64>>,
        config: &EstimationConfig,
    ) -> Self {
        let least_squares = config.minimizer.capabilities().least_squares;
        let options = LikelihoodOptions {
            residuals: least_squares,
            missing_estimates: false,
            ..config.likelihood.clone()
        };
        Self {
            mapping,
            y,
            x,
            options,
            parallel: config.parallel,
        }
    }

    /// Concentrated likelihood of the model mapped from an admitted vector.
    pub fn likelihood(&self, p: &DVector<f64>, options: &LikelihoodOptions) -> Result<ConcentratedLikelihood> {
        let ssf = self.mapping.map(p)?.to_ssf()?;
        concentrated_likelihood(&ssf, self.y, self.x, options)
    }
}

impl<M: ParametricMapping> Objective for LikelihoodObjective<'_, M> {
    fn dim(&self) -> usize {
        self.mapping.dim()
    }

    fn evaluate(&self, p: &DVector<f64>) -> Result<ObjectivePoint> {
        let mut q = p.clone();
        if self.mapping.validate(&mut q) == ParamValidation::Invalid {
            return Err(self
                .mapping
                .blocks()
                .violation(&q)?
                .unwrap_or_else(|| SsfError::Numerical("parameters rejected by validation".into())));
        }
        if let Some(violation) = self.mapping.blocks().violation(&q)? {
            return Err(violation);
        }
        let lk = self.likelihood(&q, &self.options)?.likelihood;
        let ll = lk.diffuse_log_likelihood();
        if !ll.is_finite() {
            return Err(SsfError::Numerical("non-finite log-likelihood".into()));
        }
        let residuals = if self.options.residuals {
            lk.least_squares_residuals().map(DVector::from_vec)
        } else {
            None
        };
        Ok(ObjectivePoint {
            parameters: q,
            value: -ll,
            residuals,
        })
    }

    fn epsilon(&self, p: &DVector<f64>, idx: usize) -> f64 {
        self.mapping.epsilon(p, idx)
    }

    fn parallel(&self) -> bool {
        self.parallel
    }
}

/// Maximizes the likelihood of `y` (with regression effects `x`) over the
/// parameters of `mapping`, starting from `start` or the mapping's default.
#[tracing::instrument(skip_all, fields(dim = mapping.dim(), n = y.len(), minimizer = ?config.minimizer))]
pub fn estimate<M: ParametricMapping>(
    mapping: &M,
    y: &Observations,
    x: Option<&DMatrix<f64>>,
    start: Option<&DVector<f64>>,
    config: &EstimationConfig,
) -> Result<EstimationResult<M::Model>> {
    if config.minimizer.capabilities().least_squares && !config.likelihood.concentrate_scale {
        return Err(SsfError::InvalidSpec(
            "Levenberg-Marquardt needs a concentrated likelihood".into(),
        ));
    }
    let start = start.cloned().unwrap_or_else(|| mapping.default_parameters());
    if start.len() != mapping.dim() {
        return Err(SsfError::ParamLengthMismatch {
            expected: mapping.dim(),
            got: start.len(),
        });
    }

    let objective = LikelihoodObjective::new(mapping, y, x, config);
    let (point, converged, iterations, evaluations) = if mapping.dim() == 0 {
        (objective.evaluate(&start)?, true, 0, 1)
    } else {
        let minimizer = config.minimizer.build(&config.settings);
        let outcome = minimizer.minimize(&objective, &start)?;
        (outcome.point, outcome.converged, outcome.iterations, outcome.evaluations)
    };

    let (gradient, hessian) = if mapping.dim() == 0 {
        (None, None)
    } else {
        let gradient = optimizer::gradient(&objective, &point)
            .map_err(|e| debug!(error = %e, "gradient unavailable at the optimum"))
            .ok();
        let hessian = if config.compute_hessian {
            optimizer::hessian(&objective, &point)
                .map_err(|e| debug!(error = %e, "hessian unavailable at the optimum"))
                .ok()
        } else {
            None
        };
        (gradient, hessian)
    };

    let model = mapping.map(&point.parameters)?;
    let likelihood = objective.likelihood(&point.parameters, &config.likelihood)?;

    info!(
        ll = likelihood.likelihood.diffuse_log_likelihood(),
        iterations,
        evaluations,
        converged,
        "estimation finished"
    );
    if !converged {
        warn!(iterations, evaluations, "optimizer did not converge; returning the best iterate");
    }

    Ok(EstimationResult {
        parameters: point.parameters,
        model,
        likelihood,
        converged,
        gradient,
        hessian,
        iterations,
        evaluations,
    })
}

// ---------------------------------------------------------------------------
// Structural model monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollapseConfig {
    pub max_attempts: usize,
    /// Largest `2 (LL - LL0)` for which a variance is set to 0.
    pub lr_threshold: f64,
    /// Relative variances below this are set to 0 without a test.
    pub zero_threshold: f64,
}

impl Default for CollapseConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            lr_threshold: 1e-2,
            zero_threshold: 1e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub max_attempts: usize,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BsmMonitorConfig {
    pub estimation: EstimationConfig,
    pub collapse: CollapseConfig,
    pub anchor: AnchorConfig,
}

#[derive(Debug, Clone)]
pub struct BsmEstimation {
    /// Specification after the refinements, collapsed variances fixed at 0.
    pub spec: BsmSpec,
    pub anchor: Option<usize>,
    /// Slot the fixed variances of `spec` are multiples of.
    pub reference: Option<usize>,
    /// Estimation in units relative to the anchor.
    pub result: EstimationResult<BsmModel>,
    /// The estimated model with variances in the units of the data.
    pub model: BsmModel,
    /// Collapsed variance slots, in order.
    pub collapsed: Vec<usize>,
    pub anchor_switches: usize,
}

/// Estimates a `BsmSpec`, re-optimizing after each anchor switch or
/// variance collapse.
#[derive(Debug, Clone, Default)]
pub struct BsmMonitor {
    config: BsmMonitorConfig,
}

impl BsmMonitor {
    pub fn new(config: BsmMonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BsmMonitorConfig {
        &self.config
    }

    #[tracing::instrument(skip_all, fields(n = y.len()))]
    pub fn process(&self, spec: &BsmSpec, y: &Observations, x: Option<&DMatrix<f64>>) -> Result<BsmEstimation> {
        spec.validate()?;
        let mut spec = spec.clone();
        let mut anchor = spec.default_anchor();
        let reference = anchor;
        let mut start: Option<BsmModel> = None;
        let mut collapsed = Vec::new();
        let mut collapse_attempts = 0;
        let mut anchor_switches = 0;

        loop {
            let mapping = BsmMapping::with_reference(&spec, anchor, reference)?;
            let p0 = match &start {
                Some(m) => mapping.parameters(m)?,
                None => mapping.default_parameters(),
            };
            let result = estimate(&mapping, y, x, Some(&p0), &self.config.estimation)?;

            if anchor_switches < self.config.anchor.max_attempts {
                if let Some(next) = self.anchor_switch(&spec, anchor, &result.model) {
                    debug!(
                        from = anchor.map(|a| SLOT_NAMES[a]),
                        to = SLOT_NAMES[next],
                        "anchor switched"
                    );
                    let scale = result.model.variance(next).unwrap_or(1.0);
                    start = Some(result.model.scaled(1.0 / scale));
                    anchor = Some(next);
                    anchor_switches += 1;
                    continue;
                }
            }

            if collapse_attempts < self.config.collapse.max_attempts {
                let slots = self.collapse_candidates(&mapping, &result, y, x)?;
                if !slots.is_empty() {
                    collapse_attempts += 1;
                    let mut next = result.model.clone();
                    for &s in &slots {
                        debug!(slot = SLOT_NAMES[s], "variance collapsed to 0");
                        spec.set_variance_use(s, ComponentUse::Fixed(0.0));
                        next.variances[s] = Some(0.0);
                        collapsed.push(s);
                    }
                    start = Some(next);
                    continue;
                }
            }

            let sigma2 = result.likelihood.likelihood.sigma2();
            let model = result.model.scaled(sigma2);
            info!(
                collapsed = collapsed.len(),
                anchor_switches,
                ll = result.log_likelihood(),
                "structural model estimated"
            );
            return Ok(BsmEstimation {
                spec,
                anchor,
                reference,
                result,
                model,
                collapsed,
                anchor_switches,
            });
        }
    }

    /// The largest free variance, if it exceeds the anchor's.
    fn anchor_switch(&self, spec: &BsmSpec, anchor: Option<usize>, model: &BsmModel) -> Option<usize> {
        let current = anchor?;
        let (slot, value) = model.largest_free_variance(spec)?;
        (slot != current && value > 1.0).then_some(slot)
    }

    /// Free variances to set to 0: all those below `zero_threshold`, else
    /// the one with the smallest likelihood-ratio statistic if it is below
    /// `lr_threshold`.
    fn collapse_candidates(
        &self,
        mapping: &BsmMapping,
        result: &EstimationResult<BsmModel>,
        y: &Observations,
        x: Option<&DMatrix<f64>>,
    ) -> Result<Vec<usize>> {
        let cfg = &self.config.collapse;
        let free = mapping.free_slots();
        let small: Vec<usize> = free
            .iter()
            .copied()
            .filter(|&s| result.model.variance(s).is_some_and(|v| v < cfg.zero_threshold))
            .collect();
        if !small.is_empty() {
            return Ok(small);
        }

        let ll = result.log_likelihood();
        let options = LikelihoodOptions {
            residuals: false,
            missing_estimates: false,
            ..self.config.estimation.likelihood.clone()
        };
        let mut best: Option<(usize, f64)> = None;
        for &s in &free {
            let mut reduced = result.model.clone();
            reduced.variances[s] = Some(0.0);
            mapping.tie_fixed(&mut reduced);
            let ll0 = match reduced
                .to_ssf()
                .and_then(|ssf| concentrated_likelihood(&ssf, y, x, &options))
            {
                Ok(lk) => lk.likelihood.diffuse_log_likelihood(),
                Err(e) if e.is_recoverable() => {
                    debug!(slot = SLOT_NAMES[s], error = %e, "reduced model rejected");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let lr = 2.0 * (ll - ll0);
            debug!(slot = SLOT_NAMES[s], lr, "likelihood-ratio statistic");
            if best.map_or(true, |(_, b)| lr < b) {
                best = Some((s, lr));
            }
        }
        Ok(best
            .filter(|&(_, lr)| lr < cfg.lr_threshold)
            .map(|(s, _)| vec![s])
            .unwrap_or_default())
    }
}
