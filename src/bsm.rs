//! Basic structural models: level, slope, seasonal, cycle and measurement
//! noise, with variances expressed relative to an anchor pinned at 1.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::component::StateComponent;
use crate::components::{Cycle, LocalLevel, LocalLinearTrend, Seasonal, SeasonalModel};
use crate::composite::CompositeModel;
use crate::error::{Result, SsfError};
use crate::mapping::{BoundedBlock, CompositeMapping, ParameterBlock, ParametricMapping, SsfModel, VarianceBlock};

pub const LEVEL: usize = 0;
pub const SLOPE: usize = 1;
pub const SEASONAL: usize = 2;
pub const CYCLE: usize = 3;
pub const NOISE: usize = 4;

/// Variance slots in model order.
pub const SLOT_NAMES: [&str; 5] = ["level", "slope", "seasonal", "cycle", "noise"];

/// Preference order when choosing the initial anchor.
const ANCHOR_PREFERENCE: [usize; 5] = [NOISE, LEVEL, SEASONAL, CYCLE, SLOPE];

/// Largest relative variance the optimizer may reach.
const MAX_RELATIVE_VARIANCE: f64 = 1e6;

/// Relative variance used as the default starting value.
const START_VARIANCE: f64 = 0.1;

pub const CYCLE_FACTOR_BOUNDS: (f64, f64) = (0.0, 0.995);
pub const CYCLE_PERIOD_BOUNDS: (f64, f64) = (2.0, 1000.0);

/// How a variance enters the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ComponentUse {
    Unused,
    /// Held at the given multiple of the reference variance, the anchor the
    /// specification starts from. `Fixed(0.0)` removes the disturbance.
    Fixed(f64),
    Free,
}

impl ComponentUse {
    pub fn is_used(&self) -> bool {
        !matches!(self, ComponentUse::Unused)
    }

    pub fn is_free(&self) -> bool {
        matches!(self, ComponentUse::Free)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSpec {
    pub variance: ComponentUse,
    /// Damping factor, or its starting value when estimated.
    pub factor: f64,
    /// Period in observations, or its starting value when estimated.
    pub period: f64,
    pub estimate_factor: bool,
    pub estimate_period: bool,
}

impl CycleSpec {
    pub fn new(factor: f64, period: f64) -> Self {
        Self {
            variance: ComponentUse::Free,
            factor,
            period,
            estimate_factor: true,
            estimate_period: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BsmSpec {
    pub level: ComponentUse,
    pub slope: ComponentUse,
    pub seasonal: ComponentUse,
    pub seasonal_model: SeasonalModel,
    pub period: usize,
    pub cycle: Option<CycleSpec>,
    pub noise: ComponentUse,
}

impl Default for BsmSpec {
    /// Local linear trend with measurement noise.
    fn default() -> Self {
        Self {
            level: ComponentUse::Free,
            slope: ComponentUse::Free,
            seasonal: ComponentUse::Unused,
            seasonal_model: SeasonalModel::Trigonometric,
            period: 1,
            cycle: None,
            noise: ComponentUse::Free,
        }
    }
}

impl BsmSpec {
    pub fn local_level() -> Self {
        Self {
            slope: ComponentUse::Unused,
            ..Self::default()
        }
    }

    /// Local linear trend, seasonal and noise.
    pub fn basic(period: usize, seasonal_model: SeasonalModel) -> Self {
        Self {
            seasonal: ComponentUse::Free,
            seasonal_model,
            period,
            ..Self::default()
        }
    }

    pub fn variance_use(&self, slot: usize) -> ComponentUse {
        match slot {
            LEVEL => self.level,
            SLOPE => self.slope,
            SEASONAL => self.seasonal,
            CYCLE => self.cycle.map_or(ComponentUse::Unused, |c| c.variance),
            NOISE => self.noise,
            _ => ComponentUse::Unused,
        }
    }

    pub fn set_variance_use(&mut self, slot: usize, usage: ComponentUse) {
        match slot {
            LEVEL => self.level = usage,
            SLOPE => self.slope = usage,
            SEASONAL => self.seasonal = usage,
            CYCLE => {
                if let Some(c) = self.cycle.as_mut() {
                    c.variance = usage;
                }
            }
            NOISE => self.noise = usage,
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.level.is_used() && self.slope.is_used() {
            return Err(SsfError::InvalidSpec("a slope needs a level".into()));
        }
        if self.seasonal.is_used() && self.period < 2 {
            return Err(SsfError::InvalidSpec(format!(
                "seasonal component needs a period of at least 2, got {}",
                self.period
            )));
        }
        if let Some(c) = &self.cycle {
            if !c.variance.is_used() {
                return Err(SsfError::InvalidSpec("a cycle needs a variance".into()));
            }
            let (lo, hi) = CYCLE_FACTOR_BOUNDS;
            if !(c.factor >= lo && c.factor <= hi) {
                return Err(SsfError::InvalidSpec(format!(
                    "cycle factor {} outside [{}, {}]",
                    c.factor, lo, hi
                )));
            }
            let (lo, hi) = CYCLE_PERIOD_BOUNDS;
            if !(c.period >= lo && c.period <= hi) {
                return Err(SsfError::InvalidSpec(format!(
                    "cycle period {} outside [{}, {}]",
                    c.period, lo, hi
                )));
            }
        }
        for slot in 0..SLOT_NAMES.len() {
            if let ComponentUse::Fixed(v) = self.variance_use(slot) {
                if !(v >= 0.0 && v.is_finite()) {
                    return Err(SsfError::InvalidSpec(format!(
                        "fixed {} variance must be finite and non-negative, got {}",
                        SLOT_NAMES[slot], v
                    )));
                }
            }
        }
        if !(self.level.is_used() || self.seasonal.is_used() || self.cycle.is_some()) {
            return Err(SsfError::InvalidSpec("a structural model needs a state component".into()));
        }
        Ok(())
    }

    /// Slot pinned to 1 when no anchor is given: the first free variance in
    /// the order noise, level, seasonal, cycle, slope.
    pub fn default_anchor(&self) -> Option<usize> {
        ANCHOR_PREFERENCE
            .into_iter()
            .find(|&slot| self.variance_use(slot).is_free())
    }

    /// Number of free variances.
    pub fn free_variances(&self) -> usize {
        (0..SLOT_NAMES.len()).filter(|&s| self.variance_use(s).is_free()).count()
    }
}

/// Structural model with natural parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BsmModel {
    /// Variances by slot, `None` for unused components.
    pub variances: [Option<f64>; 5],
    pub seasonal_model: SeasonalModel,
    pub period: usize,
    pub cycle_factor: f64,
    pub cycle_period: f64,
}

impl BsmModel {
    pub fn variance(&self, slot: usize) -> Option<f64> {
        self.variances.get(slot).copied().flatten()
    }

    /// Same model with every variance multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> BsmModel {
        let mut out = self.clone();
        for v in out.variances.iter_mut().flatten() {
            *v *= factor;
        }
        out
    }

    /// Slot with the largest variance among those `spec` leaves free.
    pub fn largest_free_variance(&self, spec: &BsmSpec) -> Option<(usize, f64)> {
        self.variances
            .iter()
            .enumerate()
            .filter(|&(s, _)| spec.variance_use(s).is_free())
            .filter_map(|(s, v)| v.map(|v| (s, v)))
            .fold(None, |best: Option<(usize, f64)>, (s, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((s, v)),
            })
    }
}

impl SsfModel for BsmModel {
    fn to_ssf(&self) -> Result<CompositeModel> {
        let mut components: Vec<Box<dyn StateComponent>> = Vec::new();
        match (self.variance(LEVEL), self.variance(SLOPE)) {
            (Some(l), Some(s)) => components.push(Box::new(LocalLinearTrend::new(l, s))),
            (Some(l), None) => components.push(Box::new(LocalLevel::new(l))),
            (None, Some(_)) => return Err(SsfError::InvalidSpec("a slope needs a level".into())),
            (None, None) => {}
        }
        if let Some(v) = self.variance(SEASONAL) {
            components.push(Box::new(Seasonal::new(self.seasonal_model, self.period, v)?));
        }
        if let Some(v) = self.variance(CYCLE) {
            components.push(Box::new(Cycle::new(self.cycle_factor, self.cycle_period, v)));
        }
        CompositeModel::new(components, self.variance(NOISE).unwrap_or(0.0))
    }
}

/// Optimizer view of a `BsmSpec`.
///
/// The optimizer vector holds the square roots of the free variances other
/// than the anchor, followed by the estimated cycle factor and period.
#[derive(Debug)]
pub struct BsmMapping {
    spec: BsmSpec,
    anchor: Option<usize>,
    /// Slot the fixed variances are multiples of.
    reference: Option<usize>,
    /// Variance slots in the natural vector, anchor excluded.
    slots: Vec<usize>,
    blocks: CompositeMapping,
}

impl BsmMapping {
    pub fn new(spec: &BsmSpec) -> Result<Self> {
        Self::with_anchor(spec, spec.default_anchor())
    }

    pub fn with_anchor(spec: &BsmSpec, anchor: Option<usize>) -> Result<Self> {
        Self::with_reference(spec, anchor, spec.default_anchor())
    }

    /// Pins `anchor` to 1 while fixed variances stay multiples of the
    /// `reference` slot, which may be a free variance other than the anchor.
    pub fn with_reference(spec: &BsmSpec, anchor: Option<usize>, reference: Option<usize>) -> Result<Self> {
        spec.validate()?;
        if let Some(r) = reference {
            if !spec.variance_use(r).is_used() {
                return Err(SsfError::InvalidSpec(format!(
                    "reference {} is not in the model",
                    SLOT_NAMES.get(r).copied().unwrap_or("?")
                )));
            }
        }
        if let Some(a) = anchor {
            if !spec.variance_use(a).is_free() {
                return Err(SsfError::InvalidSpec(format!(
                    "anchor {} is not a free variance",
                    SLOT_NAMES.get(a).copied().unwrap_or("?")
                )));
            }
        }
        let slots: Vec<usize> = (0..SLOT_NAMES.len())
            .filter(|&s| spec.variance_use(s).is_used() && Some(s) != anchor)
            .collect();
        let labels = slots.iter().map(|&s| SLOT_NAMES[s].to_string()).collect();
        let mut parts: Vec<Box<dyn ParameterBlock>> =
            vec![Box::new(VarianceBlock::new(labels, MAX_RELATIVE_VARIANCE))];
        if spec.cycle.is_some() {
            parts.push(Box::new(BoundedBlock::new(
                vec!["cycle factor".into(), "cycle period".into()],
                vec![CYCLE_FACTOR_BOUNDS.0, CYCLE_PERIOD_BOUNDS.0],
                vec![CYCLE_FACTOR_BOUNDS.1, CYCLE_PERIOD_BOUNDS.1],
            )));
        }
        let mut blocks = CompositeMapping::new(parts);
        for (i, &s) in slots.iter().enumerate() {
            if let ComponentUse::Fixed(v) = spec.variance_use(s) {
                blocks.fix(i, v)?;
            }
        }
        if let Some(c) = &spec.cycle {
            if !c.estimate_factor {
                blocks.fix(slots.len(), c.factor)?;
            }
            if !c.estimate_period {
                blocks.fix(slots.len() + 1, c.period)?;
            }
        }
        Ok(Self {
            spec: spec.clone(),
            anchor,
            reference,
            slots,
            blocks,
        })
    }

    pub fn reference(&self) -> Option<usize> {
        self.reference
    }

    /// Sets every nonzero fixed variance of `model` to its multiple of the
    /// reference variance.
    pub fn tie_fixed(&self, model: &mut BsmModel) {
        let base = self.reference.and_then(|r| model.variance(r)).unwrap_or(1.0);
        for &s in &self.slots {
            if let ComponentUse::Fixed(v) = self.spec.variance_use(s) {
                if Some(s) != self.reference {
                    model.variances[s] = Some(v * base);
                }
            }
        }
    }

    pub fn spec(&self) -> &BsmSpec {
        &self.spec
    }

    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    /// Free variance slots in optimizer order.
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|&(i, _)| !self.blocks.is_fixed(i))
            .map(|(_, &s)| s)
            .collect()
    }

    /// Optimizer index of a variance slot, if it is free.
    pub fn index_of(&self, slot: usize) -> Option<usize> {
        let global = self.slots.iter().position(|&s| s == slot)?;
        (0..self.blocks.dim()).find(|&k| self.blocks.global_index(k) == global)
    }

    fn natural(&self, model: &BsmModel) -> Vec<f64> {
        let mut natural: Vec<f64> = self
            .slots
            .iter()
            .map(|&s| model.variance(s).unwrap_or(0.0))
            .collect();
        if self.spec.cycle.is_some() {
            natural.push(model.cycle_factor);
            natural.push(model.cycle_period);
        }
        natural
    }
}

impl ParametricMapping for BsmMapping {
    type Model = BsmModel;

    fn blocks(&self) -> &CompositeMapping {
        &self.blocks
    }

    fn map(&self, p: &DVector<f64>) -> Result<BsmModel> {
        let natural = self.blocks.to_natural(p)?;
        let mut variances = [None; 5];
        if let Some(a) = self.anchor {
            variances[a] = Some(1.0);
        }
        for (i, &s) in self.slots.iter().enumerate() {
            variances[s] = Some(natural[i]);
        }
        let (cycle_factor, cycle_period) = match &self.spec.cycle {
            Some(_) => (natural[self.slots.len()], natural[self.slots.len() + 1]),
            None => (0.0, 0.0),
        };
        let mut model = BsmModel {
            variances,
            seasonal_model: self.spec.seasonal_model,
            period: self.spec.period,
            cycle_factor,
            cycle_period,
        };
        self.tie_fixed(&mut model);
        Ok(model)
    }

    fn parameters(&self, model: &BsmModel) -> Result<DVector<f64>> {
        self.blocks.from_natural(&self.natural(model))
    }

    fn default_parameters(&self) -> DVector<f64> {
        let mut natural = vec![START_VARIANCE; self.slots.len()];
        if let Some(c) = &self.spec.cycle {
            natural.push(c.factor);
            natural.push(c.period);
        }
        self.blocks
            .from_natural(&natural)
            .unwrap_or_else(|_| DVector::zeros(self.blocks.dim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_default_anchor_prefers_noise() {
        assert_eq!(BsmSpec::default().default_anchor(), Some(NOISE));
        let spec = BsmSpec {
            noise: ComponentUse::Fixed(0.0),
            ..BsmSpec::default()
        };
        assert_eq!(spec.default_anchor(), Some(LEVEL));
    }

    #[test]
    fn test_validate() {
        assert!(BsmSpec::default().validate().is_ok());
        let no_level = BsmSpec {
            level: ComponentUse::Unused,
            ..BsmSpec::default()
        };
        assert!(no_level.validate().is_err());
        let bad_period = BsmSpec {
            seasonal: ComponentUse::Free,
            period: 1,
            ..BsmSpec::default()
        };
        assert!(bad_period.validate().is_err());
        let bad_cycle = BsmSpec {
            cycle: Some(CycleSpec::new(1.2, 20.0)),
            ..BsmSpec::default()
        };
        assert!(bad_cycle.validate().is_err());
    }

    #[test]
    fn test_mapping_dims_and_anchor() {
        let spec = BsmSpec::basic(4, SeasonalModel::Dummy);
        let mapping = BsmMapping::new(&spec).unwrap();
        assert_eq!(mapping.anchor(), Some(NOISE));
        assert_eq!(mapping.dim(), 3);
        assert_eq!(mapping.free_slots(), vec![LEVEL, SLOPE, SEASONAL]);
        let model = mapping.map(&mapping.default_parameters()).unwrap();
        assert_eq!(model.variance(NOISE), Some(1.0));
        assert_abs_diff_eq!(model.variance(LEVEL).unwrap(), START_VARIANCE, epsilon = 1e-12);
        let ssf = model.to_ssf().unwrap();
        assert_eq!(ssf.dim(), 2 + 3);
        assert_eq!(ssf.diffuse_dim(), 5);
    }

    #[test]
    fn test_fixed_variance_leaves_optimizer() {
        let spec = BsmSpec {
            slope: ComponentUse::Fixed(0.0),
            ..BsmSpec::default()
        };
        let mapping = BsmMapping::new(&spec).unwrap();
        assert_eq!(mapping.dim(), 1);
        assert_eq!(mapping.index_of(LEVEL), Some(0));
        assert_eq!(mapping.index_of(SLOPE), None);
        let model = mapping.map(&DVector::from_vec(vec![0.5])).unwrap();
        assert_abs_diff_eq!(model.variance(LEVEL).unwrap(), 0.25, epsilon = 1e-12);
        assert_eq!(model.variance(SLOPE), Some(0.0));
    }

    #[test]
    fn test_cycle_parameters_roundtrip() {
        let spec = BsmSpec {
            slope: ComponentUse::Unused,
            cycle: Some(CycleSpec::new(0.8, 12.0)),
            ..BsmSpec::default()
        };
        let mapping = BsmMapping::new(&spec).unwrap();
        assert_eq!(mapping.dim(), 4);
        let p = mapping.default_parameters();
        let model = mapping.map(&p).unwrap();
        assert_abs_diff_eq!(model.cycle_factor, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(model.cycle_period, 12.0, epsilon = 1e-12);
        let back = mapping.parameters(&model).unwrap();
        assert_abs_diff_eq!((back - p).amax(), 0.0, epsilon = 1e-12);
        assert!(!mapping.check_boundaries(&DVector::from_vec(vec![0.3, 0.3, 1.5, 12.0])));
    }

    #[test]
    fn test_fixed_variance_follows_reference() {
        let spec = BsmSpec {
            seasonal: ComponentUse::Fixed(0.5),
            period: 4,
            ..BsmSpec::local_level()
        };
        let mapping = BsmMapping::with_reference(&spec, Some(LEVEL), Some(NOISE)).unwrap();
        assert_eq!(mapping.free_slots(), vec![NOISE]);
        let p = mapping.parameters(&BsmModel {
            variances: [Some(1.0), None, Some(0.0), None, Some(0.04)],
            seasonal_model: SeasonalModel::Dummy,
            period: 4,
            cycle_factor: 0.0,
            cycle_period: 0.0,
        })
        .unwrap();
        let model = mapping.map(&p).unwrap();
        assert_eq!(model.variance(LEVEL), Some(1.0));
        assert_abs_diff_eq!(model.variance(NOISE).unwrap(), 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(model.variance(SEASONAL).unwrap(), 0.02, epsilon = 1e-12);

        let mut reduced = model.clone();
        reduced.variances[NOISE] = Some(0.0);
        mapping.tie_fixed(&mut reduced);
        assert_eq!(reduced.variance(SEASONAL), Some(0.0));
    }

    #[test]
    fn test_fixed_variance_relative_to_default_anchor() {
        let spec = BsmSpec {
            seasonal: ComponentUse::Fixed(0.5),
            period: 4,
            ..BsmSpec::local_level()
        };
        let mapping = BsmMapping::new(&spec).unwrap();
        assert_eq!(mapping.reference(), Some(NOISE));
        let model = mapping.map(&mapping.default_parameters()).unwrap();
        assert_eq!(model.variance(SEASONAL), Some(0.5));
        assert!(BsmMapping::with_reference(&spec, Some(NOISE), Some(SLOPE)).is_err());
    }

    #[test]
    fn test_anchor_must_be_free() {
        let spec = BsmSpec::local_level();
        assert!(BsmMapping::with_anchor(&spec, Some(SLOPE)).is_err());
        let mapping = BsmMapping::with_anchor(&spec, Some(LEVEL)).unwrap();
        assert_eq!(mapping.free_slots(), vec![NOISE]);
    }

    #[test]
    fn test_largest_free_variance_and_scaling() {
        let model = BsmModel {
            variances: [Some(2.0), None, Some(5.0), None, Some(1.0)],
            seasonal_model: SeasonalModel::Dummy,
            period: 4,
            cycle_factor: 0.0,
            cycle_period: 0.0,
        };
        let mut spec = BsmSpec {
            seasonal: ComponentUse::Fixed(5.0),
            period: 4,
            ..BsmSpec::local_level()
        };
        assert_eq!(model.largest_free_variance(&spec), Some((LEVEL, 2.0)));
        spec.seasonal = ComponentUse::Free;
        assert_eq!(model.largest_free_variance(&spec), Some((SEASONAL, 5.0)));
        let scaled = model.scaled(3.0);
        assert_eq!(scaled.variance(LEVEL), Some(6.0));
        assert_eq!(scaled.variance(SLOPE), None);
    }
}
