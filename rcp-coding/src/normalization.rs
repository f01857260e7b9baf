//! Response value normalization
//!
//! Turns a raw response value into the key used to detect duplicates,
//! according to the workspace's matching flags.

use rcp_common::{MatchingFlag, MatchingFlags};

/// Canonical comparison key for a raw value
///
/// - `IGNORE_CASE`: lower-cases the value
/// - `IGNORE_WHITESPACE`: trims and collapses inner whitespace runs to one space
/// - otherwise the value is returned verbatim
///
/// `None` maps to the empty string. Empty values are filtered out before
/// duplicate grouping, so this only keeps the function total.
pub fn normalize(raw: Option<&str>, flags: &MatchingFlags) -> String {
    let Some(raw) = raw else {
        return String::new();
    };

    let mut value = if flags.contains(MatchingFlag::IgnoreWhitespace) {
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        raw.to_string()
    };

    if flags.contains(MatchingFlag::IgnoreCase) {
        value = value.to_lowercase();
    }

    value
}
