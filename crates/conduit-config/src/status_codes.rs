//! HTTP status-code rule sets
//!
//! Operators describe which upstream status codes disable a channel and
//! which are worth retrying as a comma-separated list of single codes and
//! `start-end` ranges, e.g. `401,403,500-503`. Parsing validates every
//! token, then sorts and merges overlapping or adjacent ranges so matching
//! is a scan over disjoint intervals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MIN_CODE: u16 = 100;
const MAX_CODE: u16 = 599;

/// Default rules for automatically disabling a channel
pub const DEFAULT_DISABLE_RULES: &str = "401";

/// Default rules for retrying on another channel
pub const DEFAULT_RETRY_RULES: &str = "100-199,300-399,401-407,409-499,500-503,505-523,525-599";

/// Inclusive range of status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCodeRange {
    pub start: u16,
    pub end: u16,
}

impl StatusCodeRange {
    pub const fn contains(self, code: u16) -> bool {
        self.start <= code && code <= self.end
    }
}

impl fmt::Display for StatusCodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Rejected rule tokens, reported all at once
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid http status code rules: {}", .invalid.join(", "))]
pub struct StatusCodeRangeError {
    /// Offending tokens, in input order
    pub invalid: Vec<String>,
}

/// Sorted, merged, non-overlapping status-code ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCodeRanges(Vec<StatusCodeRange>);

impl StatusCodeRanges {
    /// Parse a rule string
    ///
    /// Accepts `,` and the full-width `，` as separators and ignores empty
    /// tokens. An empty input yields an empty set.
    pub fn parse(input: &str) -> Result<Self, StatusCodeRangeError> {
        let normalized = input.trim().replace('，', ",");

        let mut ranges = Vec::new();
        let mut invalid = Vec::new();

        for token in normalized.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match parse_token(token) {
                Some(range) => ranges.push(range),
                None => invalid.push(token.to_owned()),
            }
        }

        if !invalid.is_empty() {
            return Err(StatusCodeRangeError { invalid });
        }

        Ok(Self(merge(ranges)))
    }

    /// Built-in rules for automatic disabling
    pub fn default_disable() -> Self {
        Self(vec![StatusCodeRange { start: 401, end: 401 }])
    }

    /// Built-in rules for retrying
    pub fn default_retry() -> Self {
        Self::parse(DEFAULT_RETRY_RULES).unwrap_or_default()
    }

    /// Whether `code` is inside the configured ranges
    ///
    /// Codes outside 100-599 never match.
    pub fn contains(&self, code: u16) -> bool {
        if !(MIN_CODE..=MAX_CODE).contains(&code) {
            return false;
        }
        self.0.iter().any(|r| r.contains(code))
    }

    pub fn ranges(&self) -> &[StatusCodeRange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_token(token: &str) -> Option<StatusCodeRange> {
    let (start, end) = match token.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (start.trim(), end.trim());
            if start.is_empty() || end.is_empty() {
                return None;
            }
            (start.parse::<u16>().ok()?, end.parse::<u16>().ok()?)
        }
        None => {
            let code = token.parse::<u16>().ok()?;
            (code, code)
        }
    };

    let in_bounds = |c: u16| (MIN_CODE..=MAX_CODE).contains(&c);
    if start > end || !in_bounds(start) || !in_bounds(end) {
        return None;
    }

    Some(StatusCodeRange { start, end })
}

fn merge(mut ranges: Vec<StatusCodeRange>) -> Vec<StatusCodeRange> {
    ranges.sort_unstable();

    let mut merged: Vec<StatusCodeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }

    merged
}

impl fmt::Display for StatusCodeRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for StatusCodeRanges {
    type Err = StatusCodeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for StatusCodeRanges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for StatusCodeRanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> StatusCodeRange {
        StatusCodeRange { start, end }
    }

    #[test]
    fn overlapping_input_is_merged_and_sorted() {
        let parsed = StatusCodeRanges::parse("500-505,504,401,403,402").unwrap();
        assert_eq!(parsed.ranges(), &[range(401, 403), range(500, 505)]);
    }

    #[test]
    fn format_then_parse_is_stable() {
        let first = StatusCodeRanges::parse("429, 500-503,401,502-510,100-199").unwrap();
        let formatted = first.to_string();
        let second = StatusCodeRanges::parse(&formatted).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.to_string(), formatted);
        insta::assert_snapshot!(formatted, @"100-199,401,429,500-510");
    }

    #[test]
    fn full_width_comma_is_a_separator() {
        let parsed = StatusCodeRanges::parse("401，403").unwrap();
        assert_eq!(parsed.ranges(), &[range(401, 401), range(403, 403)]);
    }

    #[test]
    fn empty_input_is_empty_set() {
        assert!(StatusCodeRanges::parse("").unwrap().is_empty());
        assert!(StatusCodeRanges::parse("  , ,").unwrap().is_empty());
    }

    #[test]
    fn invalid_tokens_are_all_reported() {
        let err = StatusCodeRanges::parse("401,99,abc,510-500,600,-5,200-").unwrap_err();
        assert_eq!(err.invalid, vec!["99", "abc", "510-500", "600", "-5", "200-"]);
        assert_eq!(
            err.to_string(),
            "invalid http status code rules: 99, abc, 510-500, 600, -5, 200-"
        );
    }

    #[test]
    fn adjacent_ranges_merge() {
        let parsed = StatusCodeRanges::parse("401-403,404,405-410").unwrap();
        assert_eq!(parsed.ranges(), &[range(401, 410)]);
    }

    #[test]
    fn out_of_range_codes_never_match() {
        let all = StatusCodeRanges::parse("100-599").unwrap();
        assert!(all.contains(100));
        assert!(all.contains(599));
        assert!(!all.contains(0));
        assert!(!all.contains(99));
        assert!(!all.contains(600));
        assert!(!all.contains(999));
    }

    #[test]
    fn default_rule_sets() {
        let disable = StatusCodeRanges::default_disable();
        assert!(disable.contains(401));
        assert!(!disable.contains(403));

        let retry = StatusCodeRanges::default_retry();
        insta::assert_snapshot!(retry.to_string(), @"100-199,300-399,401-407,409-503,505-523,525-599");
        assert!(retry.contains(429));
        assert!(retry.contains(500));
        assert!(!retry.contains(408));
        assert!(!retry.contains(504));
        assert!(!retry.contains(524));
        assert!(!retry.contains(200));
    }

    #[test]
    fn deserializes_from_toml_string() {
        #[derive(Deserialize)]
        struct Holder {
            codes: StatusCodeRanges,
        }

        let holder: Holder = toml::from_str(r#"codes = "502,500-501""#).unwrap();
        assert_eq!(holder.codes.ranges(), &[range(500, 502)]);

        let err = toml::from_str::<Holder>(r#"codes = "700""#).err().unwrap();
        assert!(err.to_string().contains("invalid http status code rules: 700"));
    }
}
