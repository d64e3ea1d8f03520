//! Random-intercept mixed model fitted on cluster-level summaries.
//!
//! Each cluster `c` is reduced to a link-scale summary `y_c` with a sampling
//! variance `v_c`:
//!
//! - normal: cluster mean, `v_c = s_w^2 / m_c` (pooled within-cluster variance)
//! - binary: empirical logit `log((k + 0.5) / (m - k + 0.5))`,
//!   `v_c = 1/(k + 0.5) + 1/(m - k + 0.5)`
//! - poisson: `log((sum + 0.5) / m)`, `v_c = 1/(sum + 0.5)`
//! - negative binomial: as poisson plus `alpha_hat / m_c`, with the NB2
//!   overdispersion `alpha_hat` estimated by moments from within-cluster spread
//!
//! Summaries follow `y_c = beta_{arm(c)} + u_c + e_c`, `u_c ~ N(0, tau^2)`,
//! `e_c ~ N(0, v_c)`. `tau^2` is estimated by maximum likelihood with Fisher
//! scoring, bounded below at zero; given `tau^2` the group means are
//! inverse-variance weighted averages. A boundary estimate is a singular fit.

use std::f64::consts::PI;

use cps_core::{
    CoefficientStats, Error, Family, FittedModel, FixedEffects, FormulaSpec, Result,
    SimulatedDataset, StatisticKind,
};
use cps_prob::normal;
use serde::{Deserialize, Serialize};

/// Optimizer settings for the `tau^2` Fisher-scoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlmmSettings {
    /// Maximum Fisher-scoring iterations before the fit is flagged non-convergent.
    pub max_iter: usize,
    /// Relative step tolerance on `tau^2`.
    pub tol: f64,
    /// `tau^2 / mean(v_c)` below this is reported as a singular fit.
    pub singular_tol: f64,
}

impl Default for GlmmSettings {
    fn default() -> Self {
        Self { max_iter: 100, tol: 1e-8, singular_tol: 1e-8 }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ClusterSummary {
    pub arm: usize,
    pub y: f64,
    pub var: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClusterAcc {
    arm: usize,
    m: usize,
    sum: f64,
    sumsq: f64,
}

impl ClusterAcc {
    fn mean(&self) -> f64 {
        self.sum / self.m as f64
    }

    /// Within-cluster sum of squared deviations.
    fn ss(&self) -> f64 {
        (self.sumsq - self.sum * self.sum / self.m as f64).max(0.0)
    }
}

pub(crate) fn cluster_summaries(
    data: &SimulatedDataset,
    family: Family,
) -> Result<Vec<ClusterSummary>> {
    let mut acc = vec![ClusterAcc::default(); data.n_clusters];
    for o in &data.observations {
        let a = acc.get_mut(o.cluster).ok_or_else(|| {
            Error::Computation(format!("cluster id {} out of range", o.cluster))
        })?;
        a.arm = o.arm;
        a.m += 1;
        a.sum += o.y;
        a.sumsq += o.y * o.y;
    }
    let acc: Vec<ClusterAcc> = acc.into_iter().filter(|a| a.m > 0).collect();
    if acc.is_empty() {
        return Err(Error::Computation("dataset has no observations".to_string()));
    }

    let summaries = match family {
        Family::Normal => {
            let n: usize = acc.iter().map(|a| a.m).sum();
            let df = n.saturating_sub(acc.len());
            if df == 0 {
                return Err(Error::Computation(
                    "no within-cluster degrees of freedom for the residual variance".to_string(),
                ));
            }
            let s2 = acc.iter().map(ClusterAcc::ss).sum::<f64>() / df as f64;
            if !(s2 > 0.0) {
                return Err(Error::Computation(format!("residual variance is {s2}")));
            }
            acc.iter()
                .map(|a| ClusterSummary { arm: a.arm, y: a.mean(), var: s2 / a.m as f64 })
                .collect()
        }
        Family::Binary => acc
            .iter()
            .map(|a| {
                let k = a.sum + 0.5;
                let f = a.m as f64 - a.sum + 0.5;
                ClusterSummary { arm: a.arm, y: (k / f).ln(), var: 1.0 / k + 1.0 / f }
            })
            .collect(),
        Family::Poisson | Family::NegativeBinomial => {
            let overdispersion = if family == Family::NegativeBinomial {
                let num: f64 = acc.iter().map(|a| a.ss() - a.sum).sum();
                let den: f64 = acc.iter().map(|a| a.sum * a.sum / a.m as f64).sum();
                if den > 0.0 { (num / den).max(0.0) } else { 0.0 }
            } else {
                0.0
            };
            acc.iter()
                .map(|a| {
                    let s = a.sum + 0.5;
                    ClusterSummary {
                        arm: a.arm,
                        y: (s / a.m as f64).ln(),
                        var: 1.0 / s + overdispersion / a.m as f64,
                    }
                })
                .collect()
        }
    };
    Ok(summaries)
}

#[derive(Debug, Clone)]
pub(crate) struct RandomInterceptFit {
    pub means: Vec<f64>,
    pub mean_vars: Vec<f64>,
    pub tau_sq: f64,
    pub log_likelihood: f64,
    pub converged: bool,
    pub singular: bool,
    pub n_iter: usize,
}

/// Inverse-variance weighted group means and their variances at fixed `tau_sq`.
fn weighted_means(
    s: &[ClusterSummary],
    group: &[usize],
    n_groups: usize,
    tau_sq: f64,
) -> (Vec<f64>, Vec<f64>) {
    let mut wsum = vec![0.0; n_groups];
    let mut wy = vec![0.0; n_groups];
    for (c, &g) in s.iter().zip(group) {
        let w = 1.0 / (c.var + tau_sq);
        wsum[g] += w;
        wy[g] += w * c.y;
    }
    let means = wy.iter().zip(&wsum).map(|(a, b)| a / b).collect();
    let vars = wsum.iter().map(|w| 1.0 / w).collect();
    (means, vars)
}

pub(crate) fn fit_random_intercept(
    s: &[ClusterSummary],
    group: &[usize],
    n_groups: usize,
    settings: &GlmmSettings,
) -> Result<RandomInterceptFit> {
    let mut counts = vec![0usize; n_groups];
    for &g in group {
        counts[g] += 1;
    }
    if let Some(g) = counts.iter().position(|&n| n == 0) {
        return Err(Error::Computation(format!("group {g} has no clusters")));
    }

    let k = s.len();
    let mean_v = s.iter().map(|c| c.var).sum::<f64>() / k as f64;

    // Moment start: residual variance around unweighted group means minus sampling variance.
    let mut tau_sq = if k > n_groups {
        let mut sums = vec![0.0; n_groups];
        for (c, &g) in s.iter().zip(group) {
            sums[g] += c.y;
        }
        let ss: f64 = s
            .iter()
            .zip(group)
            .map(|(c, &g)| (c.y - sums[g] / counts[g] as f64).powi(2))
            .sum();
        (ss / (k - n_groups) as f64 - mean_v).max(0.0)
    } else {
        0.0
    };

    let mut converged = false;
    let mut n_iter = 0;
    for iter in 1..=settings.max_iter {
        n_iter = iter;
        let (means, _) = weighted_means(s, group, n_groups, tau_sq);
        let mut score = 0.0;
        let mut info = 0.0;
        for (c, &g) in s.iter().zip(group) {
            let w = 1.0 / (c.var + tau_sq);
            let r = c.y - means[g];
            score += 0.5 * (w * w * r * r - w);
            info += 0.5 * w * w;
        }
        if !score.is_finite() || !info.is_finite() || info <= 0.0 {
            return Err(Error::Computation(format!(
                "non-finite Fisher scoring state at iteration {iter} (tau^2 = {tau_sq})"
            )));
        }
        let next = (tau_sq + score / info).max(0.0);
        let step = (next - tau_sq).abs();
        tau_sq = next;
        if step <= settings.tol * (1.0 + tau_sq) {
            converged = true;
            break;
        }
    }

    let (means, mean_vars) = weighted_means(s, group, n_groups, tau_sq);
    let log_likelihood = -0.5
        * s.iter()
            .zip(group)
            .map(|(c, &g)| {
                let v = c.var + tau_sq;
                (2.0 * PI * v).ln() + (c.y - means[g]).powi(2) / v
            })
            .sum::<f64>();
    if !log_likelihood.is_finite() {
        return Err(Error::Computation("non-finite log-likelihood".to_string()));
    }

    Ok(RandomInterceptFit {
        means,
        mean_vars,
        tau_sq,
        log_likelihood,
        converged,
        singular: tau_sq <= settings.singular_tol * mean_v,
        n_iter,
    })
}

/// Treatment-coded coefficient covariance from independent group-mean variances.
///
/// `b_0 = m_0`, `b_k = m_k - m_0`: `Var(b_k) = V_k + V_0`, `Cov(b_0, b_k) = -V_0`,
/// `Cov(b_j, b_k) = V_0` for `j != k`.
pub(crate) fn contrast_covariance(mean_vars: &[f64]) -> Vec<f64> {
    let p = mean_vars.len();
    let v0 = mean_vars[0];
    let mut cov = vec![0.0; p * p];
    for i in 0..p {
        for j in 0..p {
            cov[i * p + j] = match (i, j) {
                (0, 0) => v0,
                (0, _) | (_, 0) => -v0,
                _ if i == j => mean_vars[i] + v0,
                _ => v0,
            };
        }
    }
    cov
}

/// Treatment-coded estimates `(b, se)` from group means and their variances.
pub(crate) fn contrasts(means: &[f64], mean_vars: &[f64]) -> Vec<(f64, f64)> {
    (0..means.len())
        .map(|k| {
            if k == 0 {
                (means[0], mean_vars[0].sqrt())
            } else {
                (means[k] - means[0], (mean_vars[k] + mean_vars[0]).sqrt())
            }
        })
        .collect()
}

/// Group index of each summary and the number of groups implied by the fixed effects.
pub(crate) fn grouping(
    arms: impl Iterator<Item = usize>,
    fixed: FixedEffects,
    n_arms: usize,
) -> (Vec<usize>, usize) {
    match fixed {
        FixedEffects::InterceptOnly => (arms.map(|_| 0).collect(), 1),
        FixedEffects::ArmContrasts => (arms.collect(), n_arms),
    }
}

/// Fit the cluster-summary random-intercept model described by `formula`.
pub fn fit(
    data: &SimulatedDataset,
    formula: &FormulaSpec,
    settings: &GlmmSettings,
) -> Result<FittedModel> {
    if formula.random.is_none() {
        return Err(Error::Validation(format!("mixed model requires a random effect: {formula}")));
    }
    let summaries = cluster_summaries(data, formula.family)?;
    let (group, n_groups) = grouping(summaries.iter().map(|c| c.arm), formula.fixed, data.n_arms);
    let ri = fit_random_intercept(&summaries, &group, n_groups, settings)?;

    let coefficients = contrasts(&ri.means, &ri.mean_vars)
        .into_iter()
        .enumerate()
        .map(|(k, (estimate, std_error))| {
            let z = estimate / std_error;
            CoefficientStats {
                name: CoefficientStats::coefficient_name(k),
                estimate,
                std_error,
                statistic: z,
                p_value: normal::two_sided_p(z),
            }
        })
        .collect();

    Ok(FittedModel {
        formula: *formula,
        coefficients,
        statistic_kind: StatisticKind::Z,
        covariance: Some(contrast_covariance(&ri.mean_vars)),
        log_likelihood: Some(ri.log_likelihood),
        random_effect_variance: Some(ri.tau_sq),
        converged: ri.converged,
        singular: Some(ri.singular),
        n_iter: ri.n_iter,
    })
}
