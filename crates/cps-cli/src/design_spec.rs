//! JSON design spec: a [`TrialDesign`] plus run settings in one file.
//!
//! Per-arm fields accept a scalar (broadcast to every arm) or a vector of
//! length `narms`. `nsubjects` additionally accepts, per arm, a scalar
//! (broadcast to that arm's clusters) or a per-cluster vector:
//!
//! ```json
//! {
//!   "narms": 3,
//!   "nclusters": 10,
//!   "nsubjects": [20, 20, [15, 25, 20, 20, 20, 20, 20, 20, 20, 20]],
//!   "family": "poisson",
//!   "outcome_param": [30, 35, 70],
//!   "sigma_b_sq": 1.0,
//!   "nsim": 200,
//!   "method": "glmm",
//!   "adjust": "holm"
//! }
//! ```

use cps_core::{Error, Family, RandomEffectDist, Result, TrialDesign};
use cps_power::PowerConfig;
use serde::Deserialize;

/// A scalar broadcast to every arm, or one value per arm.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PerArm<T> {
    /// Same value for every arm.
    Scalar(T),
    /// One value per arm.
    Vector(Vec<T>),
}

impl<T: Clone> PerArm<T> {
    fn expand(self, narms: usize, field: &str) -> Result<Vec<T>> {
        match self {
            PerArm::Scalar(v) => Ok(vec![v; narms]),
            PerArm::Vector(v) if v.len() == narms => Ok(v),
            PerArm::Vector(v) => Err(Error::Validation(format!(
                "{field} has {} entries, expected narms={narms}",
                v.len()
            ))),
        }
    }
}

/// Subjects per cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Subjects {
    /// Same cluster size everywhere.
    All(usize),
    /// Per arm: a cluster size, or one size per cluster.
    Arms(Vec<PerArm<usize>>),
}

fn default_alpha() -> f64 {
    0.05
}

/// On-disk design + run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DesignSpec {
    /// Number of arms (including the reference arm).
    pub narms: usize,
    /// Clusters per arm.
    pub nclusters: PerArm<usize>,
    /// Subjects per cluster.
    pub nsubjects: Subjects,
    /// Outcome family.
    pub family: Family,
    /// Arm means (normal), probabilities (binary) or rates (counts).
    #[serde(alias = "mu", alias = "p", alias = "counts")]
    pub outcome_param: PerArm<f64>,
    /// Between-cluster variance.
    pub sigma_b_sq: PerArm<f64>,
    /// Within-cluster variance (normal only).
    #[serde(default)]
    pub sigma_sq: Option<PerArm<f64>>,
    /// Negative-binomial size.
    #[serde(default)]
    pub negbin_size: Option<f64>,
    /// Random-effect distribution.
    #[serde(default)]
    pub random_effect: RandomEffectDist,
    /// Significance level.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Run settings (`nsim`, `method`, `adjust`, `seed`, `workers`, ...).
    #[serde(flatten)]
    pub run: PowerConfig,
}

impl DesignSpec {
    /// Parse a spec from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Coerce into a validated design and the run configuration.
    pub fn into_parts(self) -> Result<(TrialDesign, PowerConfig)> {
        let k = self.narms;
        let nclusters = self.nclusters.expand(k, "nclusters")?;

        let nsubjects = match self.nsubjects {
            Subjects::All(m) => nclusters.iter().map(|&nc| vec![m; nc]).collect(),
            Subjects::Arms(arms) => {
                if arms.len() != k {
                    return Err(Error::Validation(format!(
                        "nsubjects has {} entries, expected narms={k}",
                        arms.len()
                    )));
                }
                arms.into_iter()
                    .zip(&nclusters)
                    .enumerate()
                    .map(|(a, (entry, &nc))| entry.expand(nc, &format!("nsubjects[{a}]")))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let design = TrialDesign {
            narms: k,
            nclusters,
            nsubjects,
            outcome_param: self.outcome_param.expand(k, "outcome_param")?,
            sigma_b_sq: self.sigma_b_sq.expand(k, "sigma_b_sq")?,
            sigma_sq: self.sigma_sq.map(|s| s.expand(k, "sigma_sq")).transpose()?,
            negbin_size: self.negbin_size,
            family: self.family,
            random_effect: self.random_effect,
            alpha: self.alpha,
        };
        design.validate()?;
        self.run.validate()?;
        Ok((design, self.run))
    }
}
