//! Reference fitting backend.
//!
//! Implements the fitting and comparison contracts with the closed-form /
//! low-dimensional estimators in [`crate::glmm`] and [`crate::gee`]:
//! - mixed models are compared with their null refit by a likelihood-ratio test
//! - GEE fits are compared by a multivariate Wald test of the dropped
//!   coefficients using the robust covariance

use cps_core::{
    Error, FittedModel, FixedEffects, FormulaSpec, ModelComparisonService, ModelFittingService,
    NullComparison, Result, SimulatedDataset,
};
use cps_prob::chi_squared;
use nalgebra::{DMatrix, DVector};

use crate::gee;
use crate::glmm::{self, GlmmSettings};

/// Default in-process fitting backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend {
    /// Mixed-model optimizer settings.
    pub glmm: GlmmSettings,
}

impl ReferenceBackend {
    /// Backend with default settings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelFittingService for ReferenceBackend {
    fn fit_mixed_model(
        &self,
        data: &SimulatedDataset,
        formula: &FormulaSpec,
    ) -> Result<FittedModel> {
        glmm::fit(data, formula, &self.glmm)
    }

    fn fit_gee(&self, data: &SimulatedDataset, formula: &FormulaSpec) -> Result<FittedModel> {
        gee::fit(data, formula)
    }

    fn name(&self) -> &str {
        "reference"
    }
}

impl ModelComparisonService for ReferenceBackend {
    fn compare(
        &self,
        data: &SimulatedDataset,
        fitted: &FittedModel,
        null_formula: &FormulaSpec,
    ) -> Result<NullComparison> {
        if null_formula.fixed != FixedEffects::InterceptOnly {
            return Err(Error::Validation(format!(
                "null model must be intercept-only, got {null_formula}"
            )));
        }
        let p = fitted.coefficients.len();
        if p < 2 {
            return Err(Error::Validation("fitted model has no coefficients to test".to_string()));
        }
        let df = p - 1;

        if fitted.formula.random.is_some() {
            let null = glmm::fit(data, null_formula, &self.glmm)?;
            let (full_ll, null_ll) = match (fitted.log_likelihood, null.log_likelihood) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(Error::Computation(
                        "likelihood-ratio test needs both log-likelihoods".to_string(),
                    ));
                }
            };
            let statistic = (2.0 * (full_ll - null_ll)).max(0.0);
            Ok(NullComparison { df, statistic, p_value: chi_squared::sf(statistic, df as f64) })
        } else {
            let statistic = wald_statistic(fitted)?;
            Ok(NullComparison { df, statistic, p_value: chi_squared::sf(statistic, df as f64) })
        }
    }
}

/// `b' V^{-1} b` over every non-intercept coefficient.
fn wald_statistic(fitted: &FittedModel) -> Result<f64> {
    let p = fitted.coefficients.len();
    let cov = fitted
        .covariance
        .as_ref()
        .ok_or_else(|| Error::Computation("Wald test needs a covariance matrix".to_string()))?;
    if cov.len() != p * p {
        return Err(Error::Computation(format!(
            "covariance has {} entries, expected {}",
            cov.len(),
            p * p
        )));
    }
    let q = p - 1;
    let v = DMatrix::from_fn(q, q, |i, j| cov[(i + 1) * p + (j + 1)]);
    let b = DVector::from_fn(q, |i, _| fitted.coefficients[i + 1].estimate);
    let chol = v.cholesky().ok_or_else(|| {
        Error::Computation("contrast covariance is not positive definite".to_string())
    })?;
    let x = chol.solve(&b);
    let w = b.dot(&x);
    if !w.is_finite() {
        return Err(Error::Computation("non-finite Wald statistic".to_string()));
    }
    Ok(w)
}
