use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),
    #[error("Step detection failed: {0}")]
    StepDetection(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Non-fatal conditions reported alongside a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalWarning {
    /// The optimizer hit its iteration budget; the best iterate was returned.
    ConvergenceWarning {
        iterations: usize,
        initial_cost: f64,
        final_cost: f64,
    },
}

impl std::fmt::Display for CalWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalWarning::ConvergenceWarning {
                iterations,
                initial_cost,
                final_cost,
            } => write!(
                f,
                "optimizer did not converge after {} iterations (cost {:.4e} -> {:.4e})",
                iterations, initial_cost, final_cost
            ),
        }
    }
}

pub type CalResult<T> = Result<T, CalError>;
