//! Collaborator traits for clusterpower
//!
//! The simulation engine (cps-power) depends only on these traits, never on a
//! concrete fitting backend. Backends must be `Send + Sync`: the orchestrator
//! shares one instance across its worker pool.

use crate::Result;
use crate::types::{FittedModel, FormulaSpec, NullComparison, SimulatedDataset};

/// Statistical model fitting service.
///
/// A numerical failure (rank-deficient design, degenerate outcome) is reported
/// as `Err`; non-convergence of an otherwise finished fit is reported through
/// [`FittedModel::converged`].
pub trait ModelFittingService: Send + Sync {
    /// Fit a generalized linear mixed model.
    fn fit_mixed_model(
        &self,
        data: &SimulatedDataset,
        formula: &FormulaSpec,
    ) -> Result<FittedModel>;

    /// Fit a generalized estimating equations model.
    fn fit_gee(&self, data: &SimulatedDataset, formula: &FormulaSpec) -> Result<FittedModel>;

    /// Backend name (for logs and reports).
    fn name(&self) -> &str;
}

/// Model comparison service: test a fitted model against its null model.
pub trait ModelComparisonService: Send + Sync {
    /// Compare `fitted` with the model described by `null_formula`, refitting on `data` as needed.
    fn compare(
        &self,
        data: &SimulatedDataset,
        fitted: &FittedModel,
        null_formula: &FormulaSpec,
    ) -> Result<NullComparison>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Family, FixedEffects, StatisticKind};

    struct DummyBackend;

    impl ModelFittingService for DummyBackend {
        fn fit_mixed_model(
            &self,
            _data: &SimulatedDataset,
            formula: &FormulaSpec,
        ) -> Result<FittedModel> {
            Ok(FittedModel {
                formula: *formula,
                coefficients: vec![],
                statistic_kind: StatisticKind::Z,
                covariance: None,
                log_likelihood: Some(0.0),
                random_effect_variance: Some(0.0),
                converged: true,
                singular: Some(true),
                n_iter: 0,
            })
        }

        fn fit_gee(&self, _data: &SimulatedDataset, _formula: &FormulaSpec) -> Result<FittedModel> {
            Err(crate::Error::Computation("not supported".into()))
        }

        fn name(&self) -> &str {
            "Dummy"
        }
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend;
        let data = SimulatedDataset { n_arms: 2, n_clusters: 0, observations: vec![] };
        let formula = FormulaSpec {
            family: Family::Poisson,
            link: Family::Poisson.link(),
            fixed: FixedEffects::ArmContrasts,
            random: None,
            correlation: None,
        };
        assert_eq!(backend.name(), "Dummy");
        assert!(backend.fit_mixed_model(&data, &formula).is_ok());
        assert!(backend.fit_gee(&data, &formula).is_err());
    }
}
