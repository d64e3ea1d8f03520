//! # cps-power
//!
//! Monte Carlo power estimation for multi-arm cluster-randomized trials.
//!
//! A run simulates `nsim` trials from a [`TrialDesign`](cps_core::TrialDesign),
//! fits each with a pluggable backend, watches convergence and running power
//! for early stops, and aggregates per-arm and omnibus rejection rates.
//!
//! ```no_run
//! use cps_core::{Family, RandomEffectDist, TrialDesign};
//! use cps_power::{PowerConfig, ReferenceBackend, run_power};
//!
//! let design = TrialDesign {
//!     narms: 2,
//!     nclusters: vec![10, 10],
//!     nsubjects: vec![vec![20; 10], vec![20; 10]],
//!     outcome_param: vec![0.3, 0.5],
//!     sigma_b_sq: vec![0.2, 0.2],
//!     sigma_sq: None,
//!     negbin_size: None,
//!     family: Family::Binary,
//!     random_effect: RandomEffectDist::Normal,
//!     alpha: 0.05,
//! };
//! let report = run_power(&design, &PowerConfig::default(), &ReferenceBackend::new())?;
//! println!("{:.3}", report.arm_power[0].power);
//! # Ok::<(), cps_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod gee;
pub mod generator;
pub mod glmm;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod worker;

pub use backend::ReferenceBackend;
pub use config::{MonitorThresholds, Overrides, PowerConfig, Workers};
pub use generator::{Generator, generate};
pub use monitor::{AbortReason, Monitor, MonitorState, RunState};
pub use orchestrator::{Orchestrator, run_power};
pub use report::{FitMatrices, PowerEstimate, PowerReport, RawRunData};
pub use worker::{FitWorker, ModelPlan};
