//! # cps-core
//!
//! Core types for clusterpower: the error type, the trial/data/result model,
//! and the traits behind which model fitting is kept.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{ModelComparisonService, ModelFittingService};
pub use types::{
    CoefficientStats, Family, FittedModel, FixedEffects, FormulaSpec, Link, Method,
    ModelFitResult, NullComparison, Observation, RandomEffectDist, RandomEffects,
    SimulatedDataset, StatisticKind, TrialDesign, WorkingCorrelation,
};

/// Crate version, shared by the CLI `version` subcommand.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
