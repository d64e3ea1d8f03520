//! Aggregation of per-iteration fit results into power estimates.

use std::f64::consts::PI;

use cps_core::{CoefficientStats, Family, Method, ModelFitResult, Result, TrialDesign};
use cps_prob::{AdjustMethod, interval, p_adjust};

use crate::report::{FitMatrices, PowerEstimate};

/// Aggregated statistics for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Per-iteration coefficient matrices.
    pub matrices: FitMatrices,
    /// Power per non-reference arm.
    pub arm_power: Vec<PowerEstimate>,
    /// Model-vs-null power.
    pub omnibus_power: PowerEstimate,
}

/// The adjustment actually applied for `method`: GEE contrasts are left unadjusted.
pub fn effective_adjustment(method: Method, adjust: AdjustMethod) -> AdjustMethod {
    match method {
        Method::Glmm => adjust,
        Method::Gee => AdjustMethod::None,
    }
}

/// Build matrices and power estimates from results ordered by iteration index.
pub fn aggregate(
    results: &[ModelFitResult],
    narms: usize,
    method: Method,
    adjust: AdjustMethod,
    alpha: f64,
) -> Result<Aggregate> {
    let adjust = effective_adjustment(method, adjust);
    let n = results.len();

    let mut m = FitMatrices {
        columns: (0..narms).map(CoefficientStats::coefficient_name).collect(),
        estimates: Vec::with_capacity(n),
        std_errors: Vec::with_capacity(n),
        statistics: Vec::with_capacity(n),
        p_values: Vec::with_capacity(n),
        adjusted_p_values: Vec::with_capacity(n),
    };

    for r in results {
        let column = |f: fn(&CoefficientStats) -> f64| -> Vec<f64> {
            (0..narms).map(|k| r.arms.get(k).map(f).unwrap_or(f64::NAN)).collect()
        };
        let p = column(|c| c.p_value);

        let mut adjusted = p.clone();
        if narms > 1 {
            let contrasts = p_adjust(&p[1..], adjust);
            adjusted[1..].copy_from_slice(&contrasts);
        }

        m.estimates.push(column(|c| c.estimate));
        m.std_errors.push(column(|c| c.std_error));
        m.statistics.push(column(|c| c.statistic));
        m.p_values.push(p);
        m.adjusted_p_values.push(adjusted);
    }

    let mut arm_power = Vec::with_capacity(narms.saturating_sub(1));
    for k in 1..narms {
        let hits = m.adjusted_p_values.iter().filter(|row| row[k] < alpha).count();
        arm_power.push(estimate(m.columns[k].clone(), hits, n, alpha)?);
    }

    let omnibus_hits =
        results.iter().filter(|r| r.null_p_value().is_some_and(|p| p < alpha)).count();
    let omnibus_power = estimate("omnibus".to_string(), omnibus_hits, n, alpha)?;

    Ok(Aggregate { matrices: m, arm_power, omnibus_power })
}

fn estimate(name: String, rejections: usize, n: usize, alpha: f64) -> Result<PowerEstimate> {
    let ci = interval::wald(rejections, n, alpha)?;
    Ok(PowerEstimate { name, rejections, n, power: ci.estimate, lower: ci.lower, upper: ci.upper })
}

/// Theoretical intra-cluster correlation per arm.
///
/// Normal: `sigma_b^2 / (sigma_b^2 + sigma^2)`. Binary (latent logistic scale):
/// `sigma_b^2 / (sigma_b^2 + pi^2 / 3)`. No closed form is reported for counts.
pub fn theoretical_icc(design: &TrialDesign) -> Vec<Option<f64>> {
    (0..design.narms)
        .map(|a| {
            let sb = design.sigma_b_sq[a];
            let within = match design.family {
                Family::Normal => design.sigma_sq.as_ref().map(|v| v[a])?,
                Family::Binary => PI * PI / 3.0,
                Family::Poisson | Family::NegativeBinomial => return None,
            };
            let total = sb + within;
            if total > 0.0 { Some(sb / total) } else { None }
        })
        .collect()
}

/// Human-readable non-convergence rate, e.g. `"3/50 (6.0%) fits did not converge"`.
pub fn convergence_summary(results: &[ModelFitResult]) -> String {
    let n = results.len();
    let failed = results.iter().filter(|r| !r.converged).count();
    let pct = if n == 0 { 0.0 } else { 100.0 * failed as f64 / n as f64 };
    format!("{failed}/{n} ({pct:.1}%) fits did not converge")
}
