//! Model-fit worker: one dataset in, one normalized [`ModelFitResult`] out.

use cps_core::{
    CoefficientStats, Family, FittedModel, FixedEffects, FormulaSpec, Method,
    ModelComparisonService, ModelFitResult, ModelFittingService, RandomEffects, SimulatedDataset,
    WorkingCorrelation,
};
use serde::{Deserialize, Serialize};

/// Full and null formulas for a (family, method) pair, resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPlan {
    /// Fitting method.
    pub method: Method,
    /// `y ~ arm` (+ random intercept for GLMM).
    pub full: FormulaSpec,
    /// `y ~ 1` with the same random / correlation structure.
    pub null: FormulaSpec,
}

impl ModelPlan {
    /// Build the plan for `family` fitted by `method`.
    pub fn new(family: Family, method: Method) -> Self {
        let (random, correlation) = match method {
            Method::Glmm => (Some(RandomEffects::ClusterIntercept), None),
            Method::Gee => (None, Some(WorkingCorrelation::Independence)),
        };
        let full = FormulaSpec {
            family,
            link: family.link(),
            fixed: FixedEffects::ArmContrasts,
            random,
            correlation,
        };
        Self { method, full, null: FormulaSpec { fixed: FixedEffects::InterceptOnly, ..full } }
    }
}

/// Wraps a fitting service and a comparison service behind one `fit` call.
///
/// Numerical failures from either service are absorbed here: the result is
/// marked non-convergent with NaN statistics and the caller keeps going.
pub struct FitWorker<'a, S: ?Sized> {
    service: &'a S,
    plan: ModelPlan,
    narms: usize,
}

impl<'a, S> FitWorker<'a, S>
where
    S: ModelFittingService + ModelComparisonService + ?Sized,
{
    /// Worker for designs with `narms` arms.
    pub fn new(service: &'a S, plan: ModelPlan, narms: usize) -> Self {
        Self { service, plan, narms }
    }

    /// The resolved formulas.
    pub fn plan(&self) -> &ModelPlan {
        &self.plan
    }

    fn fit_once(&self, data: &SimulatedDataset) -> cps_core::Result<FittedModel> {
        match self.plan.method {
            Method::Glmm => self.service.fit_mixed_model(data, &self.plan.full),
            Method::Gee => self.service.fit_gee(data, &self.plan.full),
        }
    }

    /// Fit, refit once if the first attempt did not converge, then compare with the null model.
    pub fn fit(&self, iteration_index: usize, data: &SimulatedDataset) -> ModelFitResult {
        let mut attempts = 1u8;
        let mut outcome = self.fit_once(data);
        let needs_refit = match &outcome {
            Ok(m) => !m.converged,
            Err(_) => true,
        };
        if needs_refit {
            // The second outcome is accepted whatever it is.
            attempts = 2;
            outcome = self.fit_once(data);
        }

        let fitted = match outcome {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(iteration = iteration_index, error = %e, "model fit failed");
                return ModelFitResult::failed(iteration_index, self.narms, attempts);
            }
        };

        let null_comparison = match self.service.compare(data, &fitted, &self.plan.null) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(iteration = iteration_index, error = %e, "null comparison failed");
                None
            }
        };

        let mut arms: Vec<CoefficientStats> = fitted.coefficients;
        if arms.len() != self.narms {
            tracing::warn!(
                iteration = iteration_index,
                got = arms.len(),
                expected = self.narms,
                "fitted model has an unexpected coefficient count"
            );
            return ModelFitResult::failed(iteration_index, self.narms, attempts);
        }
        for (k, c) in arms.iter_mut().enumerate() {
            if c.name.is_empty() {
                c.name = CoefficientStats::coefficient_name(k);
            }
        }

        ModelFitResult {
            iteration_index,
            arms,
            converged: fitted.converged,
            singular_fit: fitted.singular,
            null_comparison,
            attempts,
        }
    }
}
