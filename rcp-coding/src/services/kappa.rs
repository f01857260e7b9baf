//! Cohen's kappa for pairs of coders
//!
//! Pure computation over code pairs; the database side lives in
//! [`super::agreement`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Codes two coders assigned to the same case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePair {
    pub code1: Option<i64>,
    pub code2: Option<i64>,
}

impl CodePair {
    pub fn new(code1: Option<i64>, code2: Option<i64>) -> Self {
        Self { code1, code2 }
    }
}

/// All cases two coders both coded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderPair {
    pub coder1_id: i64,
    pub coder1_name: String,
    pub coder2_id: i64,
    pub coder2_name: String,
    pub codes: Vec<CodePair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KappaInterpretation {
    Poor,
    Slight,
    Fair,
    Moderate,
    Substantial,
    AlmostPerfect,
    NoValidPairs,
}

impl KappaInterpretation {
    /// Bucket a kappa value (inclusive lower bounds)
    pub fn from_kappa(kappa: f64) -> Self {
        if kappa < 0.0 {
            KappaInterpretation::Poor
        } else if kappa < 0.2 {
            KappaInterpretation::Slight
        } else if kappa < 0.4 {
            KappaInterpretation::Fair
        } else if kappa < 0.6 {
            KappaInterpretation::Moderate
        } else if kappa < 0.8 {
            KappaInterpretation::Substantial
        } else {
            KappaInterpretation::AlmostPerfect
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            KappaInterpretation::Poor => "poor agreement",
            KappaInterpretation::Slight => "slight agreement",
            KappaInterpretation::Fair => "fair agreement",
            KappaInterpretation::Moderate => "moderate agreement",
            KappaInterpretation::Substantial => "substantial agreement",
            KappaInterpretation::AlmostPerfect => "almost perfect agreement",
            KappaInterpretation::NoValidPairs => "no valid coding pairs",
        }
    }
}

impl fmt::Display for KappaInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Kappa result for one coder pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairKappa {
    pub coder1_id: i64,
    pub coder1_name: String,
    pub coder2_id: i64,
    pub coder2_name: String,
    /// `None` when no case has both codes
    pub kappa: Option<f64>,
    /// Observed agreement Po
    pub agreement: Option<f64>,
    /// Cases before dropping incomplete pairs
    pub total_items: usize,
    pub valid_pairs: usize,
    pub interpretation: KappaInterpretation,
}

/// Compute kappa for every coder pair
pub fn compute_pairwise(pairs: &[CoderPair]) -> Vec<PairKappa> {
    pairs.iter().map(compute_pair).collect()
}

fn compute_pair(pair: &CoderPair) -> PairKappa {
    let valid: Vec<(i64, i64)> = pair
        .codes
        .iter()
        .filter_map(|p| Some((p.code1?, p.code2?)))
        .collect();

    let (kappa, agreement, interpretation) = match cohens_kappa(&valid) {
        Some((kappa, po)) => (
            Some(round3(kappa)),
            Some(round3(po)),
            KappaInterpretation::from_kappa(kappa),
        ),
        None => (None, None, KappaInterpretation::NoValidPairs),
    };

    PairKappa {
        coder1_id: pair.coder1_id,
        coder1_name: pair.coder1_name.clone(),
        coder2_id: pair.coder2_id,
        coder2_name: pair.coder2_name.clone(),
        kappa,
        agreement,
        total_items: pair.codes.len(),
        valid_pairs: valid.len(),
        interpretation,
    }
}

/// `(kappa, observed agreement)` over complete pairs, `None` when empty
fn cohens_kappa(valid: &[(i64, i64)]) -> Option<(f64, f64)> {
    if valid.is_empty() {
        return None;
    }
    let n = valid.len() as f64;

    // Union of codes either coder used; absent combinations are zero cells
    let categories: BTreeSet<i64> = valid.iter().flat_map(|&(a, b)| [a, b]).collect();

    let mut rows: BTreeMap<i64, usize> = BTreeMap::new();
    let mut cols: BTreeMap<i64, usize> = BTreeMap::new();
    let mut diagonal = 0usize;
    for &(a, b) in valid {
        *rows.entry(a).or_default() += 1;
        *cols.entry(b).or_default() += 1;
        if a == b {
            diagonal += 1;
        }
    }

    let po = diagonal as f64 / n;
    let pe = categories
        .iter()
        .map(|c| {
            let row = rows.get(c).copied().unwrap_or(0) as f64;
            let col = cols.get(c).copied().unwrap_or(0) as f64;
            row * col
        })
        .sum::<f64>()
        / (n * n);

    let kappa = if pe == 1.0 { 1.0 } else { (po - pe) / (1.0 - pe) };
    let kappa = if kappa.is_finite() { kappa } else { 0.0 };

    Some((kappa, po))
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
