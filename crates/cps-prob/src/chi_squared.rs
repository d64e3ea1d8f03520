//! Chi-squared distribution tails.

use statrs::function::gamma::{gamma_lr, gamma_ur};

/// Chi-squared CDF via the regularized lower incomplete gamma.
pub fn cdf(x: f64, df: f64) -> f64 {
    if x.is_nan() || !(df > 0.0) {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 0.0;
    }
    if x.is_infinite() {
        return 1.0;
    }
    gamma_lr(df / 2.0, x / 2.0)
}

/// Chi-squared survival function `P(X > x)` (upper tail p-value).
pub fn sf(x: f64, df: f64) -> f64 {
    if x.is_nan() || !(df > 0.0) {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    if x.is_infinite() {
        return 0.0;
    }
    gamma_ur(df / 2.0, x / 2.0)
}
