use thiserror::Error;

/// Errors surfaced by the mechanism engine.
///
/// Construction and query errors (`UnknownName`, `DuplicateName`, `InvalidIndex`,
/// `DimensionMismatch`) are never recovered internally. `IntegrationFailure` is fatal for
/// the trajectory segment being simulated; the caller decides whether to retry with a
/// different step size or initial guess.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum MechanismError {
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },

    #[error("duplicate {kind} `{name}`")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{kind} index {index} out of range (expected < {len})")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("integration failed at t = {time}: {reason}")]
    IntegrationFailure { time: f64, reason: String },

    #[error("optimization did not converge after {iterations} steps (cost = {cost})")]
    OptimizationNotConverged { iterations: usize, cost: f64 },

    #[error("singular or indefinite matrix in {context}")]
    Singular { context: &'static str },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

pub type Result<T> = std::result::Result<T, MechanismError>;

impl MechanismError {
    pub(crate) fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownName {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }
}

/// Fails with `DimensionMismatch` unless `actual == expected`.
pub(crate) fn ensure_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(MechanismError::mismatch(what, expected, actual));
    }
    Ok(())
}
