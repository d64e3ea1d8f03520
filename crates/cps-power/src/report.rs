//! Power report returned by a run.
//!
//! Reports are write-only: NaN cells serialize as JSON `null`.

use cps_core::{Family, Method, Result, SimulatedDataset};
use cps_prob::AdjustMethod;
use serde::Serialize;

use crate::monitor::{AbortReason, MonitorState};

/// Rejection rate with its normal-approximation interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerEstimate {
    /// Coefficient / test name.
    pub name: String,
    /// Rejections at `alpha`.
    pub rejections: usize,
    /// Iterations in the denominator.
    pub n: usize,
    /// `rejections / n` (NaN, serialized as `null`, when `n == 0`).
    pub power: f64,
    /// Lower CI bound, clamped to 0.
    pub lower: f64,
    /// Upper CI bound, clamped to 1.
    pub upper: f64,
}

/// Per-iteration statistics, one row per completed iteration and one column per arm.
///
/// Column 0 is the intercept (reference arm). Failed fits are NaN rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FitMatrices {
    /// Coefficient names, one per column.
    pub columns: Vec<String>,
    /// Estimates.
    pub estimates: Vec<Vec<f64>>,
    /// Standard errors.
    pub std_errors: Vec<Vec<f64>>,
    /// z (GLMM) or Wald chi-squared (GEE) statistics.
    pub statistics: Vec<Vec<f64>>,
    /// Unadjusted p-values.
    pub p_values: Vec<Vec<f64>>,
    /// p-values after multiplicity adjustment of the contrast columns.
    pub adjusted_p_values: Vec<Vec<f64>>,
}

/// Raw data retained with `keep_raw_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRunData {
    /// Every simulated dataset, in iteration order.
    pub datasets: Vec<SimulatedDataset>,
    /// Convergence flag per iteration.
    pub converged: Vec<bool>,
}

/// Outcome of a power simulation, complete or partial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerReport {
    /// Final monitor state.
    pub status: MonitorState,
    /// Set when the run halted early.
    pub abort: Option<AbortReason>,
    /// Iterations requested.
    pub nsim_requested: usize,
    /// Iterations completed and aggregated.
    pub nsim_completed: usize,
    /// Run seed actually used.
    pub seed: u64,
    /// Outcome family.
    pub family: Family,
    /// Fitting method.
    pub method: Method,
    /// Multiplicity adjustment in effect (GEE runs are never adjusted).
    pub adjust: AdjustMethod,
    /// Significance level.
    pub alpha: f64,
    /// Fitting backend name.
    pub backend: String,
    /// Power per non-reference arm.
    pub arm_power: Vec<PowerEstimate>,
    /// Power of the model-vs-null comparison.
    pub omnibus_power: PowerEstimate,
    /// Theoretical ICC per arm (`None` for count families).
    pub icc: Vec<Option<f64>>,
    /// Per-iteration coefficient statistics.
    pub matrices: FitMatrices,
    /// Convergence summary such as `"2/50 (4.0%) fits did not converge"`.
    /// Absent when raw data is kept.
    pub convergence: Option<String>,
    /// Datasets and convergence flags.
    pub raw: Option<RawRunData>,
    /// Wall time in seconds.
    pub wall_s: f64,
}

impl PowerReport {
    /// `true` if every requested iteration ran.
    pub fn is_complete(&self) -> bool {
        self.status == MonitorState::Complete
    }

    /// `Ok(self)` for complete runs, the matching abort error otherwise.
    pub fn into_result(self) -> Result<Self> {
        match self.abort {
            Some(reason) => Err(reason.to_error()),
            None => Ok(self),
        }
    }
}
