use thiserror::Error;

/// Broad classification used by the optimizer to decide whether a failed
/// evaluation rejects a trial point or aborts the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal to the current evaluation only.
    Numerical,
    /// The proposed parameters lie outside the admissible region.
    Boundary,
    /// Precondition violated by the caller.
    Structural,
}

#[derive(Error, Debug, Clone)]
pub enum SsfError {
    #[error("covariance is not positive-definite at step {step}")]
    NotPositiveDefinite { step: usize },

    #[error("diffuse initialization did not collapse: {remaining} diffuse dimension(s) left after {n} observations")]
    NotObservable { remaining: usize, n: usize },

    #[error("no effective observations")]
    NoObservations,

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("parameter {index} = {value} violates bounds [{lower}, {upper}]")]
    BoundaryViolation {
        index: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("regression design is rank deficient (rank {rank} < {columns})")]
    RankDeficient { rank: usize, columns: usize },

    #[error("invalid specification: {0}")]
    InvalidSpec(String),

    #[error("optimizer setup failed: {0}")]
    Optimizer(String),
}

impl SsfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SsfError::NotPositiveDefinite { .. }
            | SsfError::NotObservable { .. }
            | SsfError::NoObservations
            | SsfError::Numerical(_) => ErrorKind::Numerical,
            SsfError::BoundaryViolation { .. } => ErrorKind::Boundary,
            SsfError::DimensionMismatch { .. }
            | SsfError::ParamLengthMismatch { .. }
            | SsfError::RankDeficient { .. }
            | SsfError::InvalidSpec(_)
            | SsfError::Optimizer(_) => ErrorKind::Structural,
        }
    }

    /// True when an optimizer may reject the trial point and carry on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Structural)
    }
}

pub type Result<T> = std::result::Result<T, SsfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_observable_message() {
        let e = SsfError::NotObservable { remaining: 2, n: 5 };
        assert_eq!(
            e.to_string(),
            "diffuse initialization did not collapse: 2 diffuse dimension(s) left after 5 observations"
        );
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let e = SsfError::DimensionMismatch {
            what: "regressors",
            expected: 120,
            got: 100,
        };
        assert_eq!(
            e.to_string(),
            "dimension mismatch in regressors: expected 120, got 100"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(SsfError::NoObservations.kind(), ErrorKind::Numerical);
        assert_eq!(
            SsfError::BoundaryViolation {
                index: 0,
                value: 2.0,
                lower: 0.0,
                upper: 1.0
            }
            .kind(),
            ErrorKind::Boundary
        );
        assert_eq!(
            SsfError::InvalidSpec("x".into()).kind(),
            ErrorKind::Structural
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(SsfError::NotPositiveDefinite { step: 3 }.is_recoverable());
        assert!(SsfError::BoundaryViolation {
            index: 1,
            value: -1.0,
            lower: 0.0,
            upper: 1.0
        }
        .is_recoverable());
        assert!(!SsfError::RankDeficient { rank: 1, columns: 2 }.is_recoverable());
        assert!(!SsfError::ParamLengthMismatch { expected: 2, got: 3 }.is_recoverable());
    }
}
