//! Standard normal distribution utilities.

use std::f64::consts::SQRT_2;

use cps_core::{Error, Result};
use statrs::function::erf::{erfc, erfc_inv};

/// Standard normal CDF via erfc.
#[inline]
pub fn cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Two-sided p-value `2 * (1 - Phi(|z|))` for a z statistic.
///
/// Computed from the upper tail directly so tiny p-values do not cancel to 0.
#[inline]
pub fn two_sided_p(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    erfc(z.abs() / SQRT_2).min(1.0)
}

/// Standard normal quantile (inverse CDF) for `p` in `(0, 1)`.
pub fn quantile(p: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::Validation(format!("normal quantile requires p in (0, 1), got {p}")));
    }
    Ok(-SQRT_2 * erfc_inv(2.0 * p))
}
