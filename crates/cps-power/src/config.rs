//! Run configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cps_core::{Error, Method, Result};
use cps_prob::AdjustMethod;
use serde::{Deserialize, Serialize};

/// Worker-pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WorkersRepr", into = "WorkersRepr")]
pub enum Workers {
    /// Single worker on the calling thread, iterations in order.
    #[default]
    Sequential,
    /// Fixed-size thread pool.
    Fixed(usize),
    /// Pool sized to the available hardware parallelism.
    AllAvailable,
}

impl Workers {
    /// Number of OS threads this setting resolves to.
    pub fn resolve(self) -> usize {
        match self {
            Workers::Sequential => 1,
            Workers::Fixed(n) => n,
            Workers::AllAvailable => {
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
            }
        }
    }

    /// `true` for the pooled execution modes.
    pub fn is_pooled(self) -> bool {
        !matches!(self, Workers::Sequential)
    }
}

impl FromStr for Workers {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Workers::AllAvailable),
            "sequential" => Ok(Workers::Sequential),
            n => n.parse::<usize>().map(Workers::Fixed).map_err(|_| {
                Error::Validation(format!(
                    "workers must be a positive integer, 'all' or 'sequential', got '{n}'"
                ))
            }),
        }
    }
}

impl fmt::Display for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workers::Sequential => f.write_str("sequential"),
            Workers::Fixed(n) => write!(f, "{n}"),
            Workers::AllAvailable => f.write_str("all"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WorkersRepr {
    Count(usize),
    Name(String),
}

impl TryFrom<WorkersRepr> for Workers {
    type Error = Error;

    fn try_from(r: WorkersRepr) -> Result<Self> {
        match r {
            WorkersRepr::Count(n) => Ok(Workers::Fixed(n)),
            WorkersRepr::Name(s) => s.parse(),
        }
    }
}

impl From<Workers> for WorkersRepr {
    fn from(w: Workers) -> Self {
        match w {
            Workers::Fixed(n) => WorkersRepr::Count(n),
            other => WorkersRepr::Name(other.to_string()),
        }
    }
}

/// Flags that disable individual early-stop rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    /// Keep running despite a high non-convergence / singular-fit rate.
    pub poor_fit: bool,
    /// Keep running despite low running power.
    pub low_power: bool,
    /// Skip the warm-up time projection.
    pub time_limit: bool,
}

/// Early-stop thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorThresholds {
    /// Rules are only evaluated once more than this many iterations completed.
    pub min_iterations: usize,
    /// Poor-fit rate above which the run halts.
    pub max_poor_fit_rate: f64,
    /// Low-power rule runs on iterations divisible by this.
    pub low_power_check_every: usize,
    /// Running omnibus power below which the run halts.
    pub min_running_power: f64,
    /// Projected wall-time ceiling in seconds.
    pub time_budget_s: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            min_iterations: 50,
            max_poor_fit_rate: 0.25,
            low_power_check_every: 10,
            min_running_power: 0.5,
            time_budget_s: 120.0,
        }
    }
}

impl MonitorThresholds {
    /// Time budget as a [`Duration`].
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs_f64(self.time_budget_s)
    }
}

/// Configuration of one power-simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Number of simulated trials.
    pub nsim: usize,
    /// Fitting method.
    pub method: Method,
    /// Multiplicity adjustment (applied to GLMM contrast p-values only).
    pub adjust: AdjustMethod,
    /// Early-stop overrides.
    pub overrides: Overrides,
    /// Retain every simulated dataset and per-iteration convergence flags.
    pub keep_raw_data: bool,
    /// Run seed. Drawn from OS entropy when absent; the seed used is reported.
    pub seed: Option<u64>,
    /// Execution mode.
    pub workers: Workers,
    /// Early-stop thresholds.
    pub thresholds: MonitorThresholds,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            nsim: 1000,
            method: Method::Glmm,
            adjust: AdjustMethod::Holm,
            overrides: Overrides::default(),
            keep_raw_data: false,
            seed: None,
            workers: Workers::Sequential,
            thresholds: MonitorThresholds::default(),
        }
    }
}

impl PowerConfig {
    /// Check run-level parameters.
    pub fn validate(&self) -> Result<()> {
        if self.nsim == 0 {
            return Err(Error::Validation("nsim must be a positive integer".to_string()));
        }
        if let Workers::Fixed(0) = self.workers {
            return Err(Error::Validation("workers must be >= 1".to_string()));
        }
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.max_poor_fit_rate) {
            return Err(Error::Validation(format!(
                "max_poor_fit_rate must be in [0, 1], got {}",
                t.max_poor_fit_rate
            )));
        }
        if !(0.0..=1.0).contains(&t.min_running_power) {
            return Err(Error::Validation(format!(
                "min_running_power must be in [0, 1], got {}",
                t.min_running_power
            )));
        }
        if t.low_power_check_every == 0 {
            return Err(Error::Validation("low_power_check_every must be >= 1".to_string()));
        }
        if !t.time_budget_s.is_finite() || t.time_budget_s < 0.0 {
            return Err(Error::Validation(format!(
                "time_budget_s must be finite and >= 0, got {}",
                t.time_budget_s
            )));
        }
        Ok(())
    }
}
