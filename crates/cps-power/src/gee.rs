//! GEE with an independence working correlation and cluster-robust variance.
//!
//! With arm indicators as the only covariates the estimating equations solve
//! in closed form: each arm's fitted mean is its sample mean. The robust
//! (sandwich) variance of an arm mean is `G_a / (G_a - 1) * sum_c (S_c)^2 / n_a^2`,
//! where `S_c` is the cluster's summed residual and `G_a` the arm's cluster
//! count; the delta method carries it to the link scale. Each coefficient gets
//! a 1-df Wald chi-squared test.

use cps_core::{
    CoefficientStats, Error, FittedModel, FormulaSpec, Link, Result, SimulatedDataset,
    StatisticKind, WorkingCorrelation,
};
use cps_prob::chi_squared;

use crate::glmm::{contrast_covariance, contrasts, grouping};

/// Fit an independence GEE for `formula`.
///
/// Fails when an arm's mean sits on the boundary of the link's domain (for
/// example an all-zero binary arm), when an arm has a single cluster, or when
/// the robust variance vanishes.
pub fn fit(data: &SimulatedDataset, formula: &FormulaSpec) -> Result<FittedModel> {
    if formula.correlation != Some(WorkingCorrelation::Independence) {
        return Err(Error::Validation(format!("GEE requires a working correlation: {formula}")));
    }

    // Per-cluster (arm, m, sum).
    let mut clusters = vec![(0usize, 0usize, 0.0f64); data.n_clusters];
    for o in &data.observations {
        let c = clusters.get_mut(o.cluster).ok_or_else(|| {
            Error::Computation(format!("cluster id {} out of range", o.cluster))
        })?;
        c.0 = o.arm;
        c.1 += 1;
        c.2 += o.y;
    }
    clusters.retain(|c| c.1 > 0);

    let (group, n_groups) = grouping(clusters.iter().map(|c| c.0), formula.fixed, data.n_arms);

    let mut n = vec![0usize; n_groups];
    let mut sum = vec![0.0; n_groups];
    for (c, &g) in clusters.iter().zip(&group) {
        n[g] += c.1;
        sum[g] += c.2;
    }
    if let Some(g) = n.iter().position(|&ng| ng == 0) {
        return Err(Error::Computation(format!("group {g} has no observations")));
    }
    let mu: Vec<f64> = sum.iter().zip(&n).map(|(s, &ng)| s / ng as f64).collect();

    for (g, &m) in mu.iter().enumerate() {
        let inside = match formula.link {
            Link::Identity => m.is_finite(),
            Link::Logit => m > 0.0 && m < 1.0,
            Link::Log => m > 0.0 && m.is_finite(),
        };
        if !inside {
            return Err(Error::Computation(format!(
                "group {g}: mean {m} is on the boundary for the {:?} link",
                formula.link
            )));
        }
    }

    // Sandwich variance of each group mean, with the G / (G - 1) cluster correction.
    let mut meat = vec![0.0; n_groups];
    let mut n_clusters = vec![0usize; n_groups];
    for (c, &g) in clusters.iter().zip(&group) {
        let s = c.2 - c.1 as f64 * mu[g];
        meat[g] += s * s;
        n_clusters[g] += 1;
    }
    let mut beta = Vec::with_capacity(n_groups);
    let mut beta_var = Vec::with_capacity(n_groups);
    for g in 0..n_groups {
        let g_count = n_clusters[g];
        if g_count < 2 {
            return Err(Error::Computation(format!(
                "group {g}: robust variance needs at least 2 clusters, got {g_count}"
            )));
        }
        let correction = g_count as f64 / (g_count - 1) as f64;
        let v_mu = correction * meat[g] / (n[g] as f64).powi(2);
        let d = formula.link.deriv(mu[g]);
        let v = d * d * v_mu;
        if !(v > 0.0) || !v.is_finite() {
            return Err(Error::Computation(format!("group {g}: robust variance is {v}")));
        }
        beta.push(formula.link.apply(mu[g]));
        beta_var.push(v);
    }

    let coefficients = contrasts(&beta, &beta_var)
        .into_iter()
        .enumerate()
        .map(|(k, (estimate, std_error))| {
            let wald = (estimate / std_error).powi(2);
            CoefficientStats {
                name: CoefficientStats::coefficient_name(k),
                estimate,
                std_error,
                statistic: wald,
                p_value: chi_squared::sf(wald, 1.0),
            }
        })
        .collect();

    Ok(FittedModel {
        formula: *formula,
        coefficients,
        statistic_kind: StatisticKind::WaldChiSq,
        covariance: Some(contrast_covariance(&beta_var)),
        log_likelihood: None,
        random_effect_variance: None,
        converged: true,
        singular: None,
        n_iter: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use cps_core::{Family, FixedEffects, Observation};

    fn formula(family: Family) -> FormulaSpec {
        FormulaSpec {
            family,
            link: family.link(),
            fixed: FixedEffects::ArmContrasts,
            random: None,
            correlation: Some(WorkingCorrelation::Independence),
        }
    }

    fn dataset(arms: &[Vec<Vec<f64>>]) -> SimulatedDataset {
        let mut observations = Vec::new();
        let mut cluster = 0;
        for (arm, clusters) in arms.iter().enumerate() {
            for ys in clusters {
                for &y in ys {
                    observations.push(Observation { arm, cluster, y });
                }
                cluster += 1;
            }
        }
        SimulatedDataset { n_arms: arms.len(), n_clusters: cluster, observations }
    }

    #[test]
    fn test_normal_sandwich_by_hand() {
        // arm 0: clusters sums 3 and 7 over 2 subjects each, mean 2.5
        // S = 3 - 5 = -2, 7 - 5 = 2 -> meat 8, Var(mu) = 2/1 * 8 / 16 = 1
        let data = dataset(&[
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![vec![2.0, 2.0], vec![4.0, 4.0]],
        ]);
        let fit = fit(&data, &formula(Family::Normal)).unwrap();
        assert_eq!(fit.statistic_kind, StatisticKind::WaldChiSq);
        assert_abs_diff_eq!(fit.coefficients[0].estimate, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.coefficients[0].std_error, 1.0, epsilon = 1e-12);
        // arm 1 mean 3, S = 4 - 6, 8 - 6 -> Var = 2 * 8/16 = 1
        assert_abs_diff_eq!(fit.coefficients[1].estimate, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.coefficients[1].std_error, 2.0f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(fit.coefficients[1].statistic, 0.125, epsilon = 1e-12);
        assert!(fit.converged);
        assert_eq!(fit.singular, None);
    }

    #[test]
    fn test_poisson_delta_method() {
        let data = dataset(&[
            vec![vec![2.0, 4.0], vec![6.0, 8.0]],
            vec![vec![1.0, 1.0], vec![3.0, 3.0]],
        ]);
        let fit = fit(&data, &formula(Family::Poisson)).unwrap();
        // arm 0 mean 5: S = 6-10, 14-10 -> Var(mu) = 2 * 32/16 = 4; on log scale 4/25
        assert_abs_diff_eq!(fit.coefficients[0].estimate, 5.0f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(fit.coefficients[0].std_error, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_all_zero_binary_arm_fails() {
        let data = dataset(&[
            vec![vec![0.0, 0.0], vec![0.0, 0.0]],
            vec![vec![1.0, 0.0], vec![1.0, 1.0]],
        ]);
        assert!(matches!(fit(&data, &formula(Family::Binary)), Err(Error::Computation(_))));
    }

    #[test]
    fn test_single_cluster_arm_has_no_robust_variance() {
        let data = dataset(&[vec![vec![1.0, 2.0]], vec![vec![3.0, 4.0], vec![5.0, 7.0]]]);
        let err = fit(&data, &formula(Family::Normal)).unwrap_err();
        assert!(err.to_string().contains("at least 2 clusters"), "{err}");
    }

    #[test]
    fn test_cluster_correction_scales_with_cluster_count() {
        // Four clusters per arm: correction 4/3 on the raw sandwich.
        // arm 0 sums 2, 4, 6, 8 over 2 subjects: mean 2.5, S = -3, -1, 1, 3 -> meat 20
        let data = dataset(&[
            vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0], vec![4.0, 4.0]],
            vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0], vec![4.0, 4.0]],
        ]);
        let fit = fit(&data, &formula(Family::Normal)).unwrap();
        let raw: f64 = 20.0 / 64.0;
        assert_abs_diff_eq!(
            fit.coefficients[0].std_error,
            (4.0 / 3.0 * raw).sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(fit.coefficients[1].estimate, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.coefficients[1].p_value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_requires_working_correlation() {
        let data = dataset(&[vec![vec![1.0, 2.0]], vec![vec![3.0, 4.0]]]);
        let mut f = formula(Family::Normal);
        f.correlation = None;
        assert!(matches!(fit(&data, &f), Err(Error::Validation(_))));
    }
}
