//! Convergence and early-stop monitor.
//!
//! A small state machine fed one [`ModelFitResult`] at a time, in iteration
//! order. Halting is terminal: once a halt state is reached further
//! observations are ignored.
//!
//! ```text
//! Running --(i > min, poor/i > max_rate)----------------> HaltedPoorFit
//! Running --(i > min, i % every == 0, rej/i < floor)---> HaltedLowPower
//! Running --(warm-up projection > budget)-------------> HaltedTimeBudget
//! Running --(i == nsim)--------------------------------> Complete
//! ```

use std::time::Duration;

use cps_core::{Error, ModelFitResult};
use serde::{Deserialize, Serialize};

use crate::config::{MonitorThresholds, Overrides};

/// Lifecycle of a power run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Iterations still being accepted.
    Running,
    /// Too many non-convergent or singular fits.
    HaltedPoorFit,
    /// Running omnibus power below the floor.
    HaltedLowPower,
    /// Warm-up projection exceeded the time budget.
    HaltedTimeBudget,
    /// All requested iterations observed.
    Complete,
}

impl MonitorState {
    /// `true` for every state except [`MonitorState::Running`].
    pub fn is_terminal(self) -> bool {
        !matches!(self, MonitorState::Running)
    }

    /// `true` for the three halt states.
    pub fn is_halted(self) -> bool {
        matches!(
            self,
            MonitorState::HaltedPoorFit
                | MonitorState::HaltedLowPower
                | MonitorState::HaltedTimeBudget
        )
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// See [`Error::PoorFitAbort`].
    PoorFit {
        /// Iterations completed.
        iterations: usize,
        /// Poor fits observed.
        failures: usize,
        /// `failures / iterations`.
        rate: f64,
    },
    /// See [`Error::LowPowerAbort`].
    LowPower {
        /// Iterations completed.
        iterations: usize,
        /// Running omnibus power.
        power: f64,
    },
    /// See [`Error::TimeBudgetAbort`].
    TimeBudget {
        /// Projected total run time in seconds.
        projected_s: f64,
        /// Budget in seconds.
        budget_s: f64,
    },
}

impl AbortReason {
    /// Terminal state corresponding to this reason.
    pub fn state(&self) -> MonitorState {
        match self {
            AbortReason::PoorFit { .. } => MonitorState::HaltedPoorFit,
            AbortReason::LowPower { .. } => MonitorState::HaltedLowPower,
            AbortReason::TimeBudget { .. } => MonitorState::HaltedTimeBudget,
        }
    }

    /// Matching error value.
    pub fn to_error(&self) -> Error {
        match *self {
            AbortReason::PoorFit { iterations, failures, rate } => {
                Error::PoorFitAbort { iterations, failures, rate }
            }
            AbortReason::LowPower { iterations, power } => {
                Error::LowPowerAbort { iterations, power }
            }
            AbortReason::TimeBudget { projected_s, budget_s } => {
                Error::TimeBudgetAbort { projected_s, budget_s }
            }
        }
    }
}

/// Running counters, owned by the orchestrating thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Iterations observed so far.
    pub completed: usize,
    /// Non-convergent or singular fits.
    pub poor_fits: usize,
    /// Null comparisons with p < alpha.
    pub null_rejections: usize,
}

impl RunState {
    /// `poor_fits / completed` (0 before the first observation).
    pub fn poor_fit_rate(&self) -> f64 {
        ratio(self.poor_fits, self.completed)
    }

    /// `null_rejections / completed` (0 before the first observation).
    pub fn running_power(&self) -> f64 {
        ratio(self.null_rejections, self.completed)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Total run time projected from one warm-up iteration spread over `workers`.
pub fn project_run_time(warm_up: Duration, nsim: usize, workers: usize) -> Duration {
    warm_up.mul_f64(nsim as f64 / workers.max(1) as f64)
}

/// Early-stop monitor for one run.
#[derive(Debug, Clone)]
pub struct Monitor {
    nsim: usize,
    alpha: f64,
    thresholds: MonitorThresholds,
    overrides: Overrides,
    run: RunState,
    state: MonitorState,
    abort: Option<AbortReason>,
}

impl Monitor {
    /// Monitor for `nsim` iterations tested at `alpha`.
    pub fn new(
        nsim: usize,
        alpha: f64,
        thresholds: MonitorThresholds,
        overrides: Overrides,
    ) -> Self {
        Self {
            nsim,
            alpha,
            thresholds,
            overrides,
            run: RunState::default(),
            state: MonitorState::Running,
            abort: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Counters so far.
    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    /// Abort reason once halted.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort
    }

    fn halt(&mut self, reason: AbortReason) -> MonitorState {
        self.state = reason.state();
        self.abort = Some(reason);
        self.state
    }

    /// Compare a projected total run time with the budget.
    ///
    /// Only meaningful before the first observation; a no-op under the
    /// time-limit override or once terminal.
    pub fn check_time_budget(&mut self, projected: Duration) -> MonitorState {
        if self.state.is_terminal() || self.overrides.time_limit {
            return self.state;
        }
        let budget = self.thresholds.time_budget();
        if projected > budget {
            return self.halt(AbortReason::TimeBudget {
                projected_s: projected.as_secs_f64(),
                budget_s: budget.as_secs_f64(),
            });
        }
        self.state
    }

    /// Record the next iteration (in index order) and return the new state.
    pub fn observe(&mut self, result: &ModelFitResult) -> MonitorState {
        if self.state.is_terminal() {
            return self.state;
        }

        self.run.completed += 1;
        if result.is_poor_fit() {
            self.run.poor_fits += 1;
        }
        if result.null_p_value().is_some_and(|p| p < self.alpha) {
            self.run.null_rejections += 1;
        }

        let i = self.run.completed;
        let t = self.thresholds;
        let past_minimum = i > t.min_iterations;

        if !self.overrides.poor_fit
            && past_minimum
            && self.run.poor_fit_rate() > t.max_poor_fit_rate
        {
            return self.halt(AbortReason::PoorFit {
                iterations: i,
                failures: self.run.poor_fits,
                rate: self.run.poor_fit_rate(),
            });
        }

        if !self.overrides.low_power
            && past_minimum
            && i % t.low_power_check_every == 0
            && self.run.running_power() < t.min_running_power
        {
            return self.halt(AbortReason::LowPower {
                iterations: i,
                power: self.run.running_power(),
            });
        }

        if i >= self.nsim {
            self.state = MonitorState::Complete;
        }
        self.state
    }
}
