//! Response status code table
//!
//! The numeric codes are persisted in the `status_v1`/`status_v2`/`status_v3`
//! columns and must never be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed enumeration of response/coding states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Unset,
    NotReached,
    Displayed,
    ValueChanged,
    DeriveError,
    CodingComplete,
    NoCoding,
    Invalid,
    CodingIncomplete,
    CodingError,
    PartlyDisplayed,
    DerivePending,
    IntendedIncomplete,
    CodeSelectionPending,
}

impl StatusCode {
    /// Every status, ordered by numeric code
    pub const ALL: [StatusCode; 14] = [
        StatusCode::Unset,
        StatusCode::NotReached,
        StatusCode::Displayed,
        StatusCode::ValueChanged,
        StatusCode::DeriveError,
        StatusCode::CodingComplete,
        StatusCode::NoCoding,
        StatusCode::Invalid,
        StatusCode::CodingIncomplete,
        StatusCode::CodingError,
        StatusCode::PartlyDisplayed,
        StatusCode::DerivePending,
        StatusCode::IntendedIncomplete,
        StatusCode::CodeSelectionPending,
    ];

    /// v1 states that make a variable eligible for duplicate analysis and manual coding
    pub const MANUAL_CODING_STATES: [StatusCode; 2] =
        [StatusCode::CodingIncomplete, StatusCode::IntendedIncomplete];

    /// Stable numeric code as stored in the database
    pub const fn code(self) -> i64 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::NotReached => 1,
            StatusCode::Displayed => 2,
            StatusCode::ValueChanged => 3,
            StatusCode::DeriveError => 4,
            StatusCode::CodingComplete => 5,
            StatusCode::NoCoding => 6,
            StatusCode::Invalid => 7,
            StatusCode::CodingIncomplete => 8,
            StatusCode::CodingError => 9,
            StatusCode::PartlyDisplayed => 10,
            StatusCode::DerivePending => 11,
            StatusCode::IntendedIncomplete => 12,
            StatusCode::CodeSelectionPending => 13,
        }
    }

    /// Look up a status by its numeric code
    ///
    /// Unknown codes yield `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    /// Symbolic name as used in exports and settings
    pub const fn as_str(self) -> &'static str {
        match self {
            StatusCode::Unset => "UNSET",
            StatusCode::NotReached => "NOT_REACHED",
            StatusCode::Displayed => "DISPLAYED",
            StatusCode::ValueChanged => "VALUE_CHANGED",
            StatusCode::DeriveError => "DERIVE_ERROR",
            StatusCode::CodingComplete => "CODING_COMPLETE",
            StatusCode::NoCoding => "NO_CODING",
            StatusCode::Invalid => "INVALID",
            StatusCode::CodingIncomplete => "CODING_INCOMPLETE",
            StatusCode::CodingError => "CODING_ERROR",
            StatusCode::PartlyDisplayed => "PARTLY_DISPLAYED",
            StatusCode::DerivePending => "DERIVE_PENDING",
            StatusCode::IntendedIncomplete => "INTENDED_INCOMPLETE",
            StatusCode::CodeSelectionPending => "CODE_SELECTION_PENDING",
        }
    }

    /// Look up a status by its symbolic name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("Unknown status: {}", s))
    }
}

impl From<StatusCode> for i64 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_roundtrip_is_total() {
        for status in StatusCode::ALL {
            assert_eq!(StatusCode::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(StatusCode::Unset.code(), 0);
        assert_eq!(StatusCode::CodingComplete.code(), 5);
        assert_eq!(StatusCode::CodingIncomplete.code(), 8);
        assert_eq!(StatusCode::IntendedIncomplete.code(), 12);
        assert_eq!(StatusCode::CodeSelectionPending.code(), 13);
    }

    #[test]
    fn test_unknown_code_is_none() {
        assert_eq!(StatusCode::from_code(14), None);
        assert_eq!(StatusCode::from_code(-1), None);
        assert_eq!(StatusCode::from_code(-111), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for status in StatusCode::ALL {
            assert_eq!(status.as_str().parse::<StatusCode>(), Ok(status));
        }
        assert!("CODING_SOMETHING".parse::<StatusCode>().is_err());
    }

    #[test]
    fn test_serde_uses_symbolic_names() {
        let json = serde_json::to_string(&StatusCode::IntendedIncomplete).unwrap();
        assert_eq!(json, "\"INTENDED_INCOMPLETE\"");
    }
}
