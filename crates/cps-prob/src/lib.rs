//! Probability building blocks for clusterpower.
//!
//! - standard normal and chi-squared tails/quantiles (statrs-backed)
//! - normal-approximation binomial intervals for power estimates
//! - multiple-comparison p-value adjustment

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chi_squared;
pub mod interval;
pub mod normal;
pub mod p_adjust;

pub use p_adjust::{AdjustMethod, p_adjust};
