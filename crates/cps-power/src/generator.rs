//! Hierarchical data generation for one simulated cluster-randomized trial.
//!
//! For each arm and each of its clusters a random intercept
//! `b ~ N(0, sigma_b_sq[arm])` (or a scaled Student-t) is drawn on the
//! linear-predictor scale. The arm parameter is mapped through the family's
//! link, shifted by `b`, and mapped back to give the cluster mean. Subjects
//! are then drawn independently given that mean:
//!
//! - normal: `N(mu_c, sigma_sq[arm])`
//! - binary: `Bernoulli(mu_c)`
//! - poisson: `Poisson(mu_c)`
//! - negative binomial: gamma–Poisson mixture with the design's `size`
//!
//! Cluster ids are assigned from one running counter, so they never repeat
//! across arms. Generation is a pure function of the design and the seed.

use cps_core::{Error, Family, Observation, RandomEffectDist, Result, SimulatedDataset, TrialDesign};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson, StandardNormal, StudentT};

/// Seeded generator for a fixed (validated) design.
#[derive(Debug, Clone)]
pub struct Generator<'a> {
    design: &'a TrialDesign,
    /// Per-arm intercept on the linear-predictor scale.
    eta: Vec<f64>,
    /// Per-arm random-effect SD.
    sd_b: Vec<f64>,
    /// Per-arm residual SD (normal family only).
    sd_w: Vec<f64>,
    student_t: Option<StudentT<f64>>,
}

impl<'a> Generator<'a> {
    /// Validate `design` and precompute per-arm constants.
    pub fn new(design: &'a TrialDesign) -> Result<Self> {
        design.validate()?;
        let link = design.family.link();
        let eta = design.outcome_param.iter().map(|&p| link.apply(p)).collect();
        let sd_b = design.sigma_b_sq.iter().map(|v| v.sqrt()).collect();
        let sd_w = match &design.sigma_sq {
            Some(v) => v.iter().map(|s| s.sqrt()).collect(),
            None => vec![0.0; design.narms],
        };
        let student_t = match design.random_effect {
            RandomEffectDist::StudentT { df } if df.is_finite() => Some(
                StudentT::new(df)
                    .map_err(|e| Error::Validation(format!("student_t df={df}: {e}")))?,
            ),
            _ => None,
        };
        Ok(Self { design, eta, sd_b, sd_w, student_t })
    }

    /// Generate one dataset from `seed`.
    pub fn generate(&self, seed: u64) -> Result<SimulatedDataset> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.generate_with_rng(&mut rng)
    }

    /// Generate one dataset, consuming draws from `rng`.
    pub fn generate_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SimulatedDataset> {
        let design = self.design;
        let link = design.family.link();
        let mut observations = Vec::with_capacity(design.total_subjects());
        let mut cluster_id = 0usize;

        for arm in 0..design.narms {
            for &m in &design.nsubjects[arm] {
                let b = self.draw_effect(arm, rng);
                let mu = link.inverse(self.eta[arm] + b);
                for _ in 0..m {
                    let y = self.draw_outcome(arm, mu, rng)?;
                    observations.push(Observation { arm, cluster: cluster_id, y });
                }
                cluster_id += 1;
            }
        }

        Ok(SimulatedDataset { n_arms: design.narms, n_clusters: cluster_id, observations })
    }

    fn draw_effect<R: Rng + ?Sized>(&self, arm: usize, rng: &mut R) -> f64 {
        let sd = self.sd_b[arm];
        let z: f64 = match &self.student_t {
            Some(t) => t.sample(rng),
            None => rng.sample(StandardNormal),
        };
        sd * z
    }

    fn draw_outcome<R: Rng + ?Sized>(&self, arm: usize, mu: f64, rng: &mut R) -> Result<f64> {
        match self.design.family {
            Family::Normal => {
                let z: f64 = rng.sample(StandardNormal);
                Ok(mu + self.sd_w[arm] * z)
            }
            Family::Binary => {
                let bern = Bernoulli::new(mu.clamp(0.0, 1.0))
                    .map_err(|e| Error::Computation(format!("bernoulli p={mu}: {e}")))?;
                Ok(if bern.sample(rng) { 1.0 } else { 0.0 })
            }
            Family::Poisson => draw_poisson(mu, rng),
            Family::NegativeBinomial => {
                // NB2 as a gamma-Poisson mixture: lambda ~ Gamma(size, mu / size).
                let size = self.design.negbin_size.unwrap_or(f64::INFINITY);
                let gamma = Gamma::new(size, mu / size)
                    .map_err(|e| Error::Computation(format!("gamma(size={size}, mu={mu}): {e}")))?;
                let lambda: f64 = gamma.sample(rng);
                draw_poisson(lambda, rng)
            }
        }
    }
}

fn draw_poisson<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> Result<f64> {
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    let pois = Poisson::new(lambda)
        .map_err(|e| Error::Computation(format!("poisson lambda={lambda}: {e}")))?;
    Ok(pois.sample(rng))
}

/// Validate `design` and generate one dataset from `seed`.
pub fn generate(design: &TrialDesign, seed: u64) -> Result<SimulatedDataset> {
    Generator::new(design)?.generate(seed)
}
