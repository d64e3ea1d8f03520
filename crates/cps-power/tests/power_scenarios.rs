//! End-to-end power runs against the reference backend and scripted stubs.

use std::time::Duration;

use cps_core::{
    CoefficientStats, Error, Family, FittedModel, FormulaSpec, Method, ModelComparisonService,
    ModelFittingService, NullComparison, RandomEffectDist, Result, SimulatedDataset, StatisticKind,
    TrialDesign,
};
use cps_power::{MonitorState, Overrides, PowerConfig, ReferenceBackend, Workers, run_power};
use cps_prob::AdjustMethod;

fn counts_design() -> TrialDesign {
    TrialDesign {
        narms: 3,
        nclusters: vec![10, 10, 10],
        nsubjects: vec![vec![20; 10], vec![20; 10], vec![20; 10]],
        outcome_param: vec![30.0, 35.0, 70.0],
        sigma_b_sq: vec![1.0, 1.0, 1.0],
        sigma_sq: None,
        negbin_size: None,
        family: Family::Poisson,
        random_effect: RandomEffectDist::Normal,
        alpha: 0.05,
    }
}

fn null_normal_design() -> TrialDesign {
    TrialDesign {
        narms: 3,
        nclusters: vec![10, 10, 10],
        nsubjects: vec![vec![20; 10], vec![20; 10], vec![20; 10]],
        outcome_param: vec![1.0, 1.0, 1.0],
        sigma_b_sq: vec![0.0, 0.0, 0.0],
        sigma_sq: Some(vec![1.0, 1.0, 1.0]),
        negbin_size: None,
        family: Family::Normal,
        random_effect: RandomEffectDist::Normal,
        alpha: 0.05,
    }
}

const ALL_OVERRIDES: Overrides = Overrides { poor_fit: true, low_power: true, time_limit: true };

/// Scripted backend: fixed convergence / singularity, optional per-fit delay.
struct Scripted {
    converged: bool,
    singular: bool,
    delay: Duration,
}

impl Scripted {
    fn model(&self, formula: &FormulaSpec, narms: usize) -> FittedModel {
        std::thread::sleep(self.delay);
        FittedModel {
            formula: *formula,
            coefficients: (0..narms)
                .map(|k| CoefficientStats {
                    name: CoefficientStats::coefficient_name(k),
                    estimate: 0.5,
                    std_error: 0.1,
                    statistic: 5.0,
                    p_value: 1e-6,
                })
                .collect(),
            statistic_kind: StatisticKind::Z,
            covariance: None,
            log_likelihood: Some(-10.0),
            random_effect_variance: Some(0.0),
            converged: self.converged,
            singular: Some(self.singular),
            n_iter: 1,
        }
    }
}

impl ModelFittingService for Scripted {
    fn fit_mixed_model(
        &self,
        data: &SimulatedDataset,
        formula: &FormulaSpec,
    ) -> Result<FittedModel> {
        Ok(self.model(formula, data.n_arms))
    }

    fn fit_gee(&self, data: &SimulatedDataset, formula: &FormulaSpec) -> Result<FittedModel> {
        Ok(self.model(formula, data.n_arms))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

impl ModelComparisonService for Scripted {
    fn compare(
        &self,
        _: &SimulatedDataset,
        fitted: &FittedModel,
        _: &FormulaSpec,
    ) -> Result<NullComparison> {
        Ok(NullComparison { df: fitted.coefficients.len() - 1, statistic: 30.0, p_value: 1e-6 })
    }
}

#[test]
fn test_three_arm_count_scenario() {
    let design = counts_design();
    let cfg = PowerConfig { nsim: 50, seed: Some(7), ..Default::default() };
    let report = run_power(&design, &cfg, &ReferenceBackend::new()).unwrap();

    assert_eq!(report.status, MonitorState::Complete);
    assert_eq!(report.nsim_completed, 50);
    assert_eq!(report.arm_power.len(), 2, "one entry per non-reference arm");
    for p in report.arm_power.iter().chain(std::iter::once(&report.omnibus_power)) {
        assert!((0.0..=1.0).contains(&p.power), "{p:?}");
        assert!(p.lower <= p.power && p.power <= p.upper, "{p:?}");
    }
    assert_eq!(report.icc, vec![None, None, None]);
    assert_eq!(report.matrices.columns, vec!["(Intercept)", "arm2", "arm3"]);
    // log(70/30) with sigma_b^2 = 1 on 10 clusters per arm is a large effect
    assert!(report.arm_power[1].power > report.arm_power[0].power);
}

fn assert_rejects_at_about_alpha(design: &TrialDesign, method: Method, seed: u64) {
    let cfg = PowerConfig {
        nsim: 1000,
        seed: Some(seed),
        method,
        adjust: AdjustMethod::None,
        overrides: ALL_OVERRIDES,
        ..Default::default()
    };
    let report = run_power(design, &cfg, &ReferenceBackend::new()).unwrap();
    assert!(report.is_complete());
    for p in report.arm_power.iter().chain(std::iter::once(&report.omnibus_power)) {
        assert!((p.power - design.alpha).abs() < 0.025, "{method:?} {}: {}", p.name, p.power);
    }
}

#[test]
fn test_null_design_rejects_at_about_alpha() {
    assert_rejects_at_about_alpha(&null_normal_design(), Method::Glmm, 11);
}

#[test]
fn test_null_design_rejects_at_about_alpha_with_gee() {
    let mut design = null_normal_design();
    design.nclusters = vec![25; 3];
    design.nsubjects = vec![vec![20; 25]; 3];
    assert_rejects_at_about_alpha(&design, Method::Gee, 12);
}

#[test]
fn test_null_count_design_rejects_at_about_alpha_with_gee() {
    let design = TrialDesign {
        nclusters: vec![40; 3],
        nsubjects: vec![vec![10; 40]; 3],
        outcome_param: vec![5.0; 3],
        sigma_b_sq: vec![0.3; 3],
        ..counts_design()
    };
    assert_rejects_at_about_alpha(&design, Method::Gee, 13);
}

#[test]
fn test_null_design_halts_for_low_power() {
    let design = null_normal_design();
    let cfg = PowerConfig {
        nsim: 500,
        seed: Some(3),
        overrides: Overrides { poor_fit: true, low_power: false, time_limit: true },
        ..Default::default()
    };
    let report = run_power(&design, &cfg, &ReferenceBackend::new()).unwrap();
    assert_eq!(report.status, MonitorState::HaltedLowPower);
    assert_eq!(report.nsim_completed, 60);
    assert!(matches!(report.into_result(), Err(Error::LowPowerAbort { iterations: 60, .. })));
}

#[test]
fn test_poor_fit_abort_before_nsim() {
    let design = counts_design();
    let svc = Scripted { converged: false, singular: false, delay: Duration::ZERO };
    let cfg = PowerConfig { nsim: 200, seed: Some(1), ..Default::default() };
    let report = run_power(&design, &cfg, &svc).unwrap();
    assert_eq!(report.status, MonitorState::HaltedPoorFit);
    assert_eq!(report.nsim_completed, 51);
    assert_eq!(report.convergence.as_deref(), Some("51/51 (100.0%) fits did not converge"));
    // every non-convergent fit was retried exactly once
    assert!(matches!(
        report.into_result(),
        Err(Error::PoorFitAbort { iterations: 51, failures: 51, .. })
    ));
}

#[test]
fn test_singular_fits_trigger_poor_fit_abort() {
    let design = counts_design();
    let svc = Scripted { converged: true, singular: true, delay: Duration::ZERO };
    let cfg =
        PowerConfig { nsim: 200, seed: Some(1), workers: Workers::Fixed(2), ..Default::default() };
    let report = run_power(&design, &cfg, &svc).unwrap();
    assert_eq!(report.status, MonitorState::HaltedPoorFit);
    assert_eq!(report.nsim_completed, 51);
}

#[test]
fn test_override_runs_to_completion() {
    let design = counts_design();
    let svc = Scripted { converged: false, singular: false, delay: Duration::ZERO };
    let cfg =
        PowerConfig { nsim: 80, seed: Some(1), overrides: ALL_OVERRIDES, ..Default::default() };
    let report = run_power(&design, &cfg, &svc).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.nsim_completed, 80);
    assert!(report.into_result().is_ok());
}

#[test]
fn test_time_budget_abort() {
    let design = counts_design();
    let svc = Scripted { converged: true, singular: false, delay: Duration::from_millis(20) };
    let mut cfg = PowerConfig { nsim: 1000, seed: Some(1), ..Default::default() };
    cfg.thresholds.time_budget_s = 1.0;
    let report = run_power(&design, &cfg, &svc).unwrap();
    assert_eq!(report.status, MonitorState::HaltedTimeBudget);
    assert_eq!(report.nsim_completed, 0);
    assert!(report.omnibus_power.power.is_nan());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "halted_time_budget");
    assert_eq!(json["abort"]["kind"], "time_budget");
    assert!(json["omnibus_power"]["power"].is_null());

    match report.into_result() {
        Err(Error::TimeBudgetAbort { projected_s, budget_s }) => {
            assert!(projected_s > budget_s);
            assert_eq!(budget_s, 1.0);
        }
        other => panic!("expected time budget abort, got {other:?}"),
    }
}

#[test]
fn test_time_limit_override_skips_warm_up() {
    let design = counts_design();
    let svc = Scripted { converged: true, singular: false, delay: Duration::from_millis(5) };
    let mut cfg = PowerConfig { nsim: 3, seed: Some(1), ..Default::default() };
    cfg.thresholds.time_budget_s = 0.0;
    cfg.overrides.time_limit = true;
    let report = run_power(&design, &cfg, &svc).unwrap();
    assert!(report.is_complete());
}

#[test]
fn test_pooled_report_equals_sequential() {
    let mut design = counts_design();
    design.family = Family::Binary;
    design.outcome_param = vec![0.2, 0.3, 0.45];
    design.sigma_b_sq = vec![0.3; 3];
    let backend = ReferenceBackend::new();
    let base = PowerConfig {
        nsim: 40,
        seed: Some(99),
        method: Method::Gee,
        overrides: ALL_OVERRIDES,
        ..Default::default()
    };

    let seq = run_power(&design, &base, &backend).unwrap();
    for workers in [Workers::Fixed(2), Workers::Fixed(5), Workers::AllAvailable] {
        let pooled =
            run_power(&design, &PowerConfig { workers, ..base.clone() }, &backend).unwrap();
        // NaN rows compare unequal, so compare the JSON forms
        assert_eq!(
            serde_json::to_value(&seq.matrices).unwrap(),
            serde_json::to_value(&pooled.matrices).unwrap(),
            "{workers}"
        );
        assert_eq!(seq.arm_power, pooled.arm_power);
        assert_eq!(seq.omnibus_power, pooled.omnibus_power);
        assert_eq!(seq.convergence, pooled.convergence);
    }
}

#[test]
fn test_pooled_halt_matches_sequential_halt() {
    let design = null_normal_design();
    let base = PowerConfig {
        nsim: 300,
        seed: Some(5),
        overrides: Overrides { poor_fit: true, low_power: false, time_limit: true },
        ..Default::default()
    };
    let backend = ReferenceBackend::new();
    let seq = run_power(&design, &base, &backend).unwrap();
    let pooled = run_power(
        &design,
        &PowerConfig { workers: Workers::Fixed(4), ..base.clone() },
        &backend,
    )
    .unwrap();
    assert_eq!(seq.status, pooled.status);
    assert_eq!(seq.nsim_completed, pooled.nsim_completed);
    assert_eq!(seq.abort, pooled.abort);
}

#[test]
fn test_same_seed_same_report() {
    let design = counts_design();
    let cfg = PowerConfig { nsim: 10, seed: Some(123), keep_raw_data: true, ..Default::default() };
    let a = run_power(&design, &cfg, &ReferenceBackend::new()).unwrap();
    let b = run_power(&design, &cfg, &ReferenceBackend::new()).unwrap();
    assert_eq!(a.raw, b.raw);
    assert_eq!(a.arm_power, b.arm_power);

    let c = run_power(
        &design,
        &PowerConfig { seed: Some(124), ..cfg },
        &ReferenceBackend::new(),
    )
    .unwrap();
    assert_ne!(a.raw, c.raw);
}
