//! Normal-approximation (Wald) intervals for a binomial proportion.

use cps_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::normal;

/// Proportion with a two-sided confidence interval, clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProportionCi {
    /// Point estimate `x / n`.
    pub estimate: f64,
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

/// `p ± z_{1-alpha/2} * sqrt(p (1 - p) / n)` for `successes` out of `n`.
///
/// With `n == 0` the estimate is NaN and the interval is the whole unit range.
pub fn wald(successes: usize, n: usize, alpha: f64) -> Result<ProportionCi> {
    if successes > n {
        return Err(Error::Validation(format!("successes ({successes}) exceed trials ({n})")));
    }
    let z = normal::quantile(1.0 - alpha / 2.0)?;
    if n == 0 {
        return Ok(ProportionCi { estimate: f64::NAN, lower: 0.0, upper: 1.0 });
    }
    let p = successes as f64 / n as f64;
    let half = z * (p * (1.0 - p) / n as f64).sqrt();
    Ok(ProportionCi {
        estimate: p,
        lower: (p - half).clamp(0.0, 1.0),
        upper: (p + half).clamp(0.0, 1.0),
    })
}
