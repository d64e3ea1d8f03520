//! Common data types for clusterpower

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Outcome family, link, method
// ---------------------------------------------------------------------------

/// Outcome distribution of a subject-level response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Continuous outcome, identity link.
    Normal,
    /// 0/1 outcome, logit link.
    #[serde(alias = "binomial")]
    Binary,
    /// Count outcome, log link.
    Poisson,
    /// Overdispersed count outcome (NB2), log link.
    #[serde(alias = "negbin", alias = "neg_binom")]
    NegativeBinomial,
}

impl Family {
    /// Canonical link used for this family.
    pub fn link(self) -> Link {
        match self {
            Family::Normal => Link::Identity,
            Family::Binary => Link::Logit,
            Family::Poisson | Family::NegativeBinomial => Link::Log,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Normal => "normal",
            Family::Binary => "binary",
            Family::Poisson => "poisson",
            Family::NegativeBinomial => "negative_binomial",
        };
        f.write_str(s)
    }
}

/// Link function between the outcome mean and the linear predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// `eta = mu`
    Identity,
    /// `eta = log(mu / (1 - mu))`
    Logit,
    /// `eta = log(mu)`
    Log,
}

impl Link {
    /// Map an outcome-scale mean onto the linear predictor scale.
    #[inline]
    pub fn apply(self, mu: f64) -> f64 {
        match self {
            Link::Identity => mu,
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Log => mu.ln(),
        }
    }

    /// Inverse link: linear predictor back to the outcome scale.
    ///
    /// The log link clamps `eta` to `[-700, 700]` so the mean stays finite and positive.
    #[inline]
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Link::Identity => eta,
            Link::Logit => {
                let e = (-eta.abs()).exp();
                if eta >= 0.0 { 1.0 / (1.0 + e) } else { e / (1.0 + e) }
            }
            Link::Log => eta.clamp(-700.0, 700.0).exp(),
        }
    }

    /// Derivative `d eta / d mu`, used for delta-method variances.
    #[inline]
    pub fn deriv(self, mu: f64) -> f64 {
        match self {
            Link::Identity => 1.0,
            Link::Logit => 1.0 / (mu * (1.0 - mu)),
            Link::Log => 1.0 / mu,
        }
    }
}

/// Model-fitting method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Generalized linear mixed model with a cluster random intercept.
    #[default]
    Glmm,
    /// Generalized estimating equations with a working correlation structure.
    Gee,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Glmm => "glmm",
            Method::Gee => "gee",
        })
    }
}

/// Distribution of the cluster-level random effect.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RandomEffectDist {
    /// `b ~ N(0, sigma_b_sq)`
    #[default]
    Normal,
    /// `b = sqrt(sigma_b_sq) * t_df`. An infinite `df` is the normal distribution.
    StudentT {
        /// Degrees of freedom (> 0, may be infinite).
        df: f64,
    },
}

// ---------------------------------------------------------------------------
// Trial design
// ---------------------------------------------------------------------------

/// Canonical (already coerced) description of a multi-arm cluster-randomized trial.
///
/// Arm 0 is the reference arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDesign {
    /// Number of arms (>= 2).
    pub narms: usize,
    /// Clusters per arm.
    pub nclusters: Vec<usize>,
    /// Subjects per cluster, `nsubjects[arm][cluster]`.
    pub nsubjects: Vec<Vec<usize>>,
    /// Per-arm outcome parameter: mean (normal), probability (binary) or rate (counts).
    pub outcome_param: Vec<f64>,
    /// Per-arm between-cluster variance on the linear-predictor scale.
    pub sigma_b_sq: Vec<f64>,
    /// Per-arm within-cluster variance. Required for [`Family::Normal`].
    #[serde(default)]
    pub sigma_sq: Option<Vec<f64>>,
    /// NB2 size parameter (`Var = mu + mu^2 / size`). Required for [`Family::NegativeBinomial`].
    #[serde(default)]
    pub negbin_size: Option<f64>,
    /// Outcome family.
    pub family: Family,
    /// Cluster random-effect distribution.
    #[serde(default)]
    pub random_effect: RandomEffectDist,
    /// Significance level.
    pub alpha: f64,
}

impl TrialDesign {
    /// Check every structural and parameter invariant.
    ///
    /// A cluster with zero subjects is rejected here, never at generation time.
    pub fn validate(&self) -> Result<()> {
        let k = self.narms;
        if k < 2 {
            return Err(Error::Validation(format!("narms must be >= 2, got {k}")));
        }
        for (name, len) in [
            ("nclusters", self.nclusters.len()),
            ("nsubjects", self.nsubjects.len()),
            ("outcome_param", self.outcome_param.len()),
            ("sigma_b_sq", self.sigma_b_sq.len()),
        ] {
            if len != k {
                return Err(Error::Validation(format!(
                    "{name} has length {len}, expected narms={k}"
                )));
            }
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(Error::Validation(format!("alpha must be in (0, 1), got {}", self.alpha)));
        }

        for arm in 0..k {
            let nc = self.nclusters[arm];
            if nc == 0 {
                return Err(Error::Validation(format!("arm {arm}: nclusters must be > 0")));
            }
            if self.nsubjects[arm].len() != nc {
                return Err(Error::Validation(format!(
                    "arm {arm}: nsubjects has {} clusters, expected {nc}",
                    self.nsubjects[arm].len()
                )));
            }
            if let Some(c) = self.nsubjects[arm].iter().position(|&m| m == 0) {
                return Err(Error::Validation(format!(
                    "arm {arm}, cluster {c}: cluster has zero subjects"
                )));
            }
            let sb = self.sigma_b_sq[arm];
            if !sb.is_finite() || sb < 0.0 {
                return Err(Error::Validation(format!(
                    "arm {arm}: sigma_b_sq must be finite and >= 0, got {sb}"
                )));
            }
            let p = self.outcome_param[arm];
            let ok = match self.family {
                Family::Normal => p.is_finite(),
                Family::Binary => p > 0.0 && p < 1.0,
                Family::Poisson | Family::NegativeBinomial => p.is_finite() && p > 0.0,
            };
            if !ok {
                return Err(Error::Validation(format!(
                    "arm {arm}: outcome parameter {p} is invalid for the {} family",
                    self.family
                )));
            }
        }

        match self.family {
            Family::Normal => {
                let sigma_sq = self.sigma_sq.as_ref().ok_or_else(|| {
                    Error::Validation("normal family requires sigma_sq".to_string())
                })?;
                if sigma_sq.len() != k {
                    return Err(Error::Validation(format!(
                        "sigma_sq has length {}, expected narms={k}",
                        sigma_sq.len()
                    )));
                }
                if let Some(v) = sigma_sq.iter().find(|v| !v.is_finite() || **v <= 0.0) {
                    return Err(Error::Validation(format!(
                        "sigma_sq must be finite and > 0, got {v}"
                    )));
                }
            }
            Family::NegativeBinomial => match self.negbin_size {
                Some(s) if s.is_finite() && s > 0.0 => {}
                other => {
                    return Err(Error::Validation(format!(
                        "negative binomial family requires negbin_size > 0, got {other:?}"
                    )));
                }
            },
            Family::Binary | Family::Poisson => {}
        }

        if let RandomEffectDist::StudentT { df } = self.random_effect {
            if !(df > 0.0) {
                return Err(Error::Validation(format!("student_t df must be > 0, got {df}")));
            }
        }
        Ok(())
    }

    /// Total number of clusters across arms.
    pub fn total_clusters(&self) -> usize {
        self.nclusters.iter().sum()
    }

    /// Total number of subjects in `arm`.
    pub fn arm_subjects(&self, arm: usize) -> usize {
        self.nsubjects[arm].iter().sum()
    }

    /// Total number of subjects across arms.
    pub fn total_subjects(&self) -> usize {
        (0..self.narms).map(|a| self.arm_subjects(a)).sum()
    }
}

// ---------------------------------------------------------------------------
// Simulated data
// ---------------------------------------------------------------------------

/// One subject record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// 0-based arm id (0 = reference).
    pub arm: usize,
    /// Globally unique 0-based cluster id.
    pub cluster: usize,
    /// Outcome value.
    pub y: f64,
}

/// One simulated trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDataset {
    /// Number of arms in the generating design.
    pub n_arms: usize,
    /// Number of distinct cluster ids (`0..n_clusters`).
    pub n_clusters: usize,
    /// Subject records, grouped by arm then cluster.
    pub observations: Vec<Observation>,
}

impl SimulatedDataset {
    /// Number of subject records.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// `true` when there are no records.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Arm id of every cluster, indexed by cluster id.
    pub fn cluster_arms(&self) -> Vec<usize> {
        let mut arms = vec![0; self.n_clusters];
        for o in &self.observations {
            arms[o.cluster] = o.arm;
        }
        arms
    }
}

// ---------------------------------------------------------------------------
// Model formulas and fitted models
// ---------------------------------------------------------------------------

/// Fixed-effects part of a model formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedEffects {
    /// `y ~ 1`
    InterceptOnly,
    /// `y ~ arm`, treatment-coded against arm 0.
    ArmContrasts,
}

/// Random-effects part of a mixed-model formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomEffects {
    /// `(1 | cluster)`
    ClusterIntercept,
}

/// Working correlation for GEE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingCorrelation {
    /// Independence working correlation with cluster-robust variance.
    Independence,
}

/// Model specification handed to a fitting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaSpec {
    /// Outcome family.
    pub family: Family,
    /// Link function.
    pub link: Link,
    /// Fixed effects.
    pub fixed: FixedEffects,
    /// Random effects (mixed models only).
    pub random: Option<RandomEffects>,
    /// Working correlation (GEE only).
    pub correlation: Option<WorkingCorrelation>,
}

impl FormulaSpec {
    /// Number of fixed-effect coefficients for a design with `narms` arms.
    pub fn n_coefficients(&self, narms: usize) -> usize {
        match self.fixed {
            FixedEffects::InterceptOnly => 1,
            FixedEffects::ArmContrasts => narms,
        }
    }
}

impl fmt::Display for FormulaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rhs = match self.fixed {
            FixedEffects::InterceptOnly => "1",
            FixedEffects::ArmContrasts => "arm",
        };
        write!(f, "y ~ {rhs}")?;
        if let Some(RandomEffects::ClusterIntercept) = self.random {
            write!(f, " + (1 | cluster)")?;
        }
        write!(f, " [{}, {:?} link", self.family, self.link)?;
        if let Some(WorkingCorrelation::Independence) = self.correlation {
            write!(f, ", independence")?;
        }
        write!(f, "]")
    }
}

/// Which test statistic a coefficient carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    /// `estimate / std_error`, two-sided normal p-value.
    Z,
    /// `(estimate / std_error)^2`, chi-squared(1) p-value.
    WaldChiSq,
}

/// Per-coefficient summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientStats {
    /// Coefficient label (`(Intercept)`, `arm2`, ...).
    pub name: String,
    /// Point estimate on the linear-predictor scale.
    pub estimate: f64,
    /// Standard error.
    pub std_error: f64,
    /// Test statistic.
    pub statistic: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

impl CoefficientStats {
    /// Placeholder for a coefficient whose fit failed. All numeric fields are NaN.
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            estimate: f64::NAN,
            std_error: f64::NAN,
            statistic: f64::NAN,
            p_value: f64::NAN,
        }
    }

    /// Standard name of the coefficient at `index` under treatment coding.
    pub fn coefficient_name(index: usize) -> String {
        if index == 0 { "(Intercept)".to_string() } else { format!("arm{}", index + 1) }
    }
}

/// Model returned by a fitting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    /// The formula that was fitted.
    pub formula: FormulaSpec,
    /// Fixed-effect coefficients in formula order.
    pub coefficients: Vec<CoefficientStats>,
    /// Statistic carried by `coefficients`.
    pub statistic_kind: StatisticKind,
    /// Coefficient covariance (row-major, p×p). `None` if unavailable.
    pub covariance: Option<Vec<f64>>,
    /// Maximized log-likelihood, for likelihood-based methods.
    pub log_likelihood: Option<f64>,
    /// Estimated random-intercept variance, for mixed models.
    pub random_effect_variance: Option<f64>,
    /// Optimizer convergence status.
    pub converged: bool,
    /// Random-effect variance on the boundary. `None` when not applicable.
    pub singular: Option<bool>,
    /// Optimizer iterations.
    pub n_iter: usize,
}

/// Result of comparing a fitted model with its null model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullComparison {
    /// Degrees of freedom of the test.
    pub df: usize,
    /// LRT or Wald chi-squared statistic.
    pub statistic: f64,
    /// p-value.
    pub p_value: f64,
}

/// Normalized outcome of one simulation iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFitResult {
    /// 0-based iteration index.
    pub iteration_index: usize,
    /// One entry per arm; entry 0 is the intercept / reference arm.
    pub arms: Vec<CoefficientStats>,
    /// Fit convergence after the refit policy was applied.
    pub converged: bool,
    /// Singular random-effect fit (mixed models only).
    pub singular_fit: Option<bool>,
    /// Model-vs-null test. `None` when the fit or the comparison failed.
    pub null_comparison: Option<NullComparison>,
    /// Fit attempts made (1, or 2 after a refit).
    pub attempts: u8,
}

impl ModelFitResult {
    /// Result for an iteration whose fit raised a numerical failure.
    pub fn failed(iteration_index: usize, narms: usize, attempts: u8) -> Self {
        Self {
            iteration_index,
            arms: (0..narms)
                .map(|i| CoefficientStats::missing(CoefficientStats::coefficient_name(i)))
                .collect(),
            converged: false,
            singular_fit: None,
            null_comparison: None,
            attempts,
        }
    }

    /// Non-convergent or singular: counts against the poor-fit threshold.
    pub fn is_poor_fit(&self) -> bool {
        !self.converged || self.singular_fit == Some(true)
    }

    /// Null-comparison p-value, if available.
    pub fn null_p_value(&self) -> Option<f64> {
        self.null_comparison.map(|c| c.p_value).filter(|p| p.is_finite())
    }
}
