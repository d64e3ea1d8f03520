//! Multiple-comparison p-value adjustment.
//!
//! Methods follow the usual definitions (Bonferroni, Holm 1979, Hochberg 1988,
//! Hommel 1988, Benjamini–Hochberg 1995, Benjamini–Yekutieli 2001). NaN
//! entries are passed through untouched and do not count towards the family
//! size.

use std::fmt;
use std::str::FromStr;

use cps_core::Error;
use serde::{Deserialize, Serialize};

/// Adjustment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AdjustMethod {
    /// Step-down Holm.
    #[default]
    #[serde(rename = "holm")]
    Holm,
    /// Step-up Hochberg.
    #[serde(rename = "hochberg")]
    Hochberg,
    /// Hommel.
    #[serde(rename = "hommel")]
    Hommel,
    /// Bonferroni.
    #[serde(rename = "bonferroni")]
    Bonferroni,
    /// Benjamini–Hochberg false discovery rate.
    #[serde(rename = "BH")]
    BenjaminiHochberg,
    /// Benjamini–Yekutieli false discovery rate under dependence.
    #[serde(rename = "BY")]
    BenjaminiYekutieli,
    /// Alias of Benjamini–Hochberg.
    #[serde(rename = "fdr")]
    Fdr,
    /// No adjustment.
    #[serde(rename = "none")]
    None,
}

impl AdjustMethod {
    /// All accepted method names.
    pub const NAMES: [&'static str; 8] =
        ["holm", "hochberg", "hommel", "bonferroni", "BH", "BY", "fdr", "none"];

    /// Canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustMethod::Holm => "holm",
            AdjustMethod::Hochberg => "hochberg",
            AdjustMethod::Hommel => "hommel",
            AdjustMethod::Bonferroni => "bonferroni",
            AdjustMethod::BenjaminiHochberg => "BH",
            AdjustMethod::BenjaminiYekutieli => "BY",
            AdjustMethod::Fdr => "fdr",
            AdjustMethod::None => "none",
        }
    }
}

impl fmt::Display for AdjustMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdjustMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "holm" => AdjustMethod::Holm,
            "hochberg" => AdjustMethod::Hochberg,
            "hommel" => AdjustMethod::Hommel,
            "bonferroni" => AdjustMethod::Bonferroni,
            "BH" => AdjustMethod::BenjaminiHochberg,
            "BY" => AdjustMethod::BenjaminiYekutieli,
            "fdr" => AdjustMethod::Fdr,
            "none" => AdjustMethod::None,
            other => {
                return Err(Error::Validation(format!(
                    "unknown adjustment method '{other}', expected one of {:?}",
                    AdjustMethod::NAMES
                )));
            }
        })
    }
}

/// Adjust `p_values` for multiple comparisons. Output is in input order.
pub fn p_adjust(p_values: &[f64], method: AdjustMethod) -> Vec<f64> {
    let finite_idx: Vec<usize> = (0..p_values.len()).filter(|&i| !p_values[i].is_nan()).collect();
    let p: Vec<f64> = finite_idx.iter().map(|&i| p_values[i]).collect();

    let adjusted = adjust_complete(&p, method);

    let mut out = p_values.to_vec();
    for (&i, q) in finite_idx.iter().zip(adjusted) {
        out[i] = q;
    }
    out
}

fn adjust_complete(p: &[f64], method: AdjustMethod) -> Vec<f64> {
    let n = p.len();
    if n <= 1 {
        return p.to_vec();
    }
    let nf = n as f64;

    // Hommel with two hypotheses coincides with Hochberg.
    let method = match method {
        AdjustMethod::Hommel if n == 2 => AdjustMethod::Hochberg,
        m => m,
    };

    match method {
        AdjustMethod::None => p.to_vec(),
        AdjustMethod::Bonferroni => p.iter().map(|&x| (nf * x).min(1.0)).collect(),
        AdjustMethod::Holm => {
            let order = ascending_order(p);
            let mut out = vec![0.0; n];
            let mut running = 0.0_f64;
            for (rank, &i) in order.iter().enumerate() {
                running = running.max((nf - rank as f64) * p[i]);
                out[i] = running.min(1.0);
            }
            out
        }
        AdjustMethod::Hochberg => step_up(p, |i| nf - i as f64 + 1.0),
        AdjustMethod::BenjaminiHochberg | AdjustMethod::Fdr => step_up(p, |i| nf / i as f64),
        AdjustMethod::BenjaminiYekutieli => {
            let q: f64 = (1..=n).map(|i| 1.0 / i as f64).sum();
            step_up(p, |i| q * nf / i as f64)
        }
        AdjustMethod::Hommel => hommel(p),
    }
}

/// Indices sorting `p` ascending (stable).
fn ascending_order(p: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..p.len()).collect();
    order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
    order
}

/// Step-up procedure: walk from the largest p-value down with a running minimum
/// of `factor(i) * p_(i)`, where `i` is the 1-based ascending rank.
fn step_up(p: &[f64], factor: impl Fn(usize) -> f64) -> Vec<f64> {
    let n = p.len();
    let order = ascending_order(p);
    let mut out = vec![0.0; n];
    let mut running = f64::INFINITY;
    for pos in (0..n).rev() {
        let i = order[pos];
        running = running.min(factor(pos + 1) * p[i]);
        out[i] = running.min(1.0);
    }
    out
}

fn hommel(p_in: &[f64]) -> Vec<f64> {
    let n = p_in.len();
    let order = ascending_order(p_in);
    let p: Vec<f64> = order.iter().map(|&i| p_in[i]).collect();

    let init = (0..n).map(|i| n as f64 * p[i] / (i + 1) as f64).fold(f64::INFINITY, f64::min);
    let mut q = vec![init; n];
    let mut pa = vec![init; n];

    for m in (2..n).rev() {
        // i1 = first n-m+1 sorted positions, i2 = the remaining m-1.
        let n1 = n - m + 1;
        let q1 = (n1..n)
            .enumerate()
            .map(|(k, i)| m as f64 * p[i] / (k + 2) as f64)
            .fold(f64::INFINITY, f64::min);
        for i in 0..n1 {
            q[i] = (m as f64 * p[i]).min(q1);
        }
        let tail = q[n1 - 1];
        for qi in q.iter_mut().skip(n1) {
            *qi = tail;
        }
        for i in 0..n {
            pa[i] = pa[i].max(q[i]);
        }
    }

    let mut out = vec![0.0; n];
    for (pos, &i) in order.iter().enumerate() {
        out[i] = pa[pos].max(p[pos]);
    }
    out
}
