//! Error types for clusterpower

use thiserror::Error;

/// clusterpower error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed trial design or run configuration. Raised before any simulation starts.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure inside a fitting routine
    #[error("Computation error: {0}")]
    Computation(String),

    /// Too many non-convergent or singular fits once the minimum iteration count was passed.
    #[error(
        "poor fit abort after {iterations} iterations: {failures} fits non-convergent or singular \
         (rate {rate:.3}); set the poor-fit override to continue"
    )]
    PoorFitAbort {
        /// Iterations completed when the run halted.
        iterations: usize,
        /// Non-convergent or singular fits observed.
        failures: usize,
        /// `failures / iterations`.
        rate: f64,
    },

    /// Running omnibus power fell below the configured floor.
    #[error(
        "low power abort after {iterations} iterations: running power {power:.3}; \
         set the low-power override to continue"
    )]
    LowPowerAbort {
        /// Iterations completed when the run halted.
        iterations: usize,
        /// Running proportion of null-comparison p-values below alpha.
        power: f64,
    },

    /// Projected wall time from the warm-up fit exceeds the budget.
    #[error(
        "time budget abort: projected {projected_s:.1}s exceeds budget {budget_s:.1}s; \
         set the time-limit override to continue"
    )]
    TimeBudgetAbort {
        /// Projected total run time in seconds.
        projected_s: f64,
        /// Configured budget in seconds.
        budget_s: f64,
    },
}

impl Error {
    /// `true` for the three early-stop kinds (poor fit, low power, time budget).
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Error::PoorFitAbort { .. } | Error::LowPowerAbort { .. } | Error::TimeBudgetAbort { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
