//! Response and coding models
//!
//! Every response carries three independent coding triads:
//! v1 (first automated pass), v2 (human/aggregation pass) and
//! v3 (second automated or resolution pass).

use crate::status::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Reserved `code_v2` marking a response as a non-master member of an
/// aggregated duplicate cluster. Never a real human code.
pub const AGGREGATION_SENTINEL_CODE: i64 = -111;

/// Status written alongside the sentinel code
pub const AGGREGATION_SENTINEL_STATUS: StatusCode = StatusCode::CodingComplete;

/// Score written alongside the sentinel code
pub const AGGREGATION_SENTINEL_SCORE: i64 = 0;

/// Duplicate threshold used when the caller does not supply one
pub const DEFAULT_DUPLICATE_THRESHOLD: i64 = 2;

/// Coding pass identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingVersion {
    V1,
    V2,
    V3,
}

impl CodingVersion {
    pub const ALL: [CodingVersion; 3] = [CodingVersion::V1, CodingVersion::V2, CodingVersion::V3];

    pub const fn as_str(self) -> &'static str {
        match self {
            CodingVersion::V1 => "v1",
            CodingVersion::V2 => "v2",
            CodingVersion::V3 => "v3",
        }
    }

    /// Column names `(status, code, score)` holding this version's triad
    pub const fn columns(self) -> (&'static str, &'static str, &'static str) {
        match self {
            CodingVersion::V1 => ("status_v1", "code_v1", "score_v1"),
            CodingVersion::V2 => ("status_v2", "code_v2", "score_v2"),
            CodingVersion::V3 => ("status_v3", "code_v3", "score_v3"),
        }
    }

    /// Versions nulled when this version is reset
    ///
    /// v2 results feed v3, so resetting v2 also resets v3.
    pub fn reset_cascade(self) -> Vec<CodingVersion> {
        match self {
            CodingVersion::V2 => vec![CodingVersion::V2, CodingVersion::V3],
            other => vec![other],
        }
    }
}

impl fmt::Display for CodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodingVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(CodingVersion::V1),
            "v2" | "2" => Ok(CodingVersion::V2),
            "v3" | "3" => Ok(CodingVersion::V3),
            other => Err(format!("Unknown coding version: {}", other)),
        }
    }
}

/// Status/code/score outcome of one coding pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingTriad {
    pub status: Option<StatusCode>,
    pub code: Option<i64>,
    pub score: Option<i64>,
}

impl CodingTriad {
    pub fn new(status: StatusCode, code: Option<i64>, score: Option<i64>) -> Self {
        Self {
            status: Some(status),
            code,
            score,
        }
    }

    /// Triad written to non-master duplicates on aggregation
    pub fn aggregated_duplicate() -> Self {
        Self::new(
            AGGREGATION_SENTINEL_STATUS,
            Some(AGGREGATION_SENTINEL_CODE),
            Some(AGGREGATION_SENTINEL_SCORE),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.code.is_none() && self.score.is_none()
    }

    /// Field-wise fallback: keep own values, fill gaps from `lower`
    pub fn or(self, lower: CodingTriad) -> CodingTriad {
        CodingTriad {
            status: self.status.or(lower.status),
            code: self.code.or(lower.code),
            score: self.score.or(lower.score),
        }
    }
}

/// One test-taker's recorded value for one (unit, variable) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    pub unit_id: i64,
    pub variable_id: String,
    pub value: Option<String>,
    pub v1: CodingTriad,
    pub v2: CodingTriad,
    pub v3: CodingTriad,
}

impl Response {
    pub fn triad(&self, version: CodingVersion) -> &CodingTriad {
        match version {
            CodingVersion::V1 => &self.v1,
            CodingVersion::V2 => &self.v2,
            CodingVersion::V3 => &self.v3,
        }
    }

    /// Effective coding: v3 > v2 > v1, first non-null wins per field
    pub fn effective(&self) -> CodingTriad {
        self.v3.or(self.v2).or(self.v1)
    }

    /// True when this response was collapsed into another as an aggregated duplicate
    pub fn is_aggregated_duplicate(&self) -> bool {
        self.v2.code == Some(AGGREGATION_SENTINEL_CODE)
    }
}

/// True for values counting as "no response given"
pub fn is_empty_value(value: Option<&str>) -> bool {
    matches!(value, None | Some("") | Some("[]"))
}

/// Workspace-level response matching option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchingFlag {
    IgnoreCase,
    IgnoreWhitespace,
    NoAggregation,
}

impl MatchingFlag {
    pub const fn as_str(self) -> &'static str {
        match self {
            MatchingFlag::IgnoreCase => "IGNORE_CASE",
            MatchingFlag::IgnoreWhitespace => "IGNORE_WHITESPACE",
            MatchingFlag::NoAggregation => "NO_AGGREGATION",
        }
    }
}

impl FromStr for MatchingFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IGNORE_CASE" => Ok(MatchingFlag::IgnoreCase),
            "IGNORE_WHITESPACE" => Ok(MatchingFlag::IgnoreWhitespace),
            "NO_AGGREGATION" => Ok(MatchingFlag::NoAggregation),
            other => Err(format!("Unknown matching flag: {}", other)),
        }
    }
}

/// Ordered set of matching flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchingFlags(BTreeSet<MatchingFlag>);

impl MatchingFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: MatchingFlag) -> Self {
        self.0.insert(flag);
        self
    }

    pub fn contains(&self, flag: MatchingFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchingFlag> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted, comma-joined flag names (`none` for the empty set)
    pub fn cache_fragment(&self) -> String {
        if self.0.is_empty() {
            return "none".to_string();
        }
        let mut names: Vec<&str> = self.0.iter().map(|f| f.as_str()).collect();
        names.sort_unstable();
        names.join(",")
    }
}

impl FromIterator<MatchingFlag> for MatchingFlags {
    fn from_iter<I: IntoIterator<Item = MatchingFlag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
