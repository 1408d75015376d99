//! Protocol version parsing and comparison.
//!
//! A version has up to four dot-separated positions: major, minor, build and
//! protocol revision. The first position must be numeric. Any later position
//! may hold a non-numeric "special" token (`1.1.0-beta`, `2.0alpha`), which
//! stops numeric parsing and ranks the version below the same numbers without
//! a suffix.
//!
//! The original input string is preserved and is what `Display` prints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{IpcError, Result};

const PART_COUNT: usize = 4;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<major>[0-9]+)(\.?(?P<minor>[^.]+))?(\.?(?P<build>[^.]+))?(\.?(?P<revision>.+))?")
        .unwrap()
});

/// A parsed protocol version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "VersionInfo", into = "VersionInfo")]
pub struct Version {
    original: String,
    numbers: [u32; PART_COUNT],
    segments: [String; PART_COUNT],
    /// How many leading positions parsed as numbers.
    numeric_parts: usize,
    special: Option<String>,
}

impl Version {
    /// Build a fully numeric version.
    pub fn new(major: u32, minor: u32, build: u32, protocol_revision: u32) -> Self {
        let original = format!("{major}.{minor}.{build}.{protocol_revision}");
        let numbers = [major, minor, build, protocol_revision];
        Self {
            original,
            segments: numbers.map(|n| n.to_string()),
            numbers,
            numeric_parts: PART_COUNT,
            special: None,
        }
    }

    /// Parse a version string.
    ///
    /// Leading and trailing whitespace is ignored for parsing but kept in the
    /// original string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let captures = VERSION_RE
            .captures(trimmed)
            .ok_or_else(|| IpcError::Validation {
                field: "version".to_string(),
                message: format!("'{input}' does not start with a numeric major version"),
            })?;

        let major: u32 = captures["major"].parse().map_err(|_| IpcError::Validation {
            field: "version".to_string(),
            message: format!("major version in '{input}' is out of range"),
        })?;

        let mut version = Self {
            original: input.to_string(),
            numbers: [0; PART_COUNT],
            segments: std::array::from_fn(|_| "0".to_string()),
            numeric_parts: 1,
            special: None,
        };
        version.numbers[0] = major;
        version.segments[0] = major.to_string();

        for (position, group) in ["minor", "build", "revision"].into_iter().enumerate() {
            let Some(part) = captures.name(group) else {
                break;
            };
            let index = position + 1;
            match part.as_str().parse::<u32>() {
                Ok(number) => {
                    version.numbers[index] = number;
                    version.segments[index] = number.to_string();
                    version.numeric_parts += 1;
                }
                Err(_) => {
                    let special = part.as_str().trim_end().to_string();
                    version.segments[index] = special.clone();
                    version.special = Some(special);
                    break;
                }
            }
        }

        Ok(version)
    }

    pub fn major(&self) -> u32 {
        self.numbers[0]
    }

    pub fn minor(&self) -> u32 {
        self.numbers[1]
    }

    pub fn build(&self) -> u32 {
        self.numbers[2]
    }

    /// The fourth position, identifying wire-incompatible revisions.
    pub fn protocol_revision(&self) -> u32 {
        self.numbers[3]
    }

    /// The non-numeric suffix, if any.
    pub fn special(&self) -> Option<&str> {
        self.special.as_deref()
    }

    pub fn is_unstable(&self) -> bool {
        self.special.is_some()
    }

    pub fn is_alpha(&self) -> bool {
        self.special.as_deref().is_some_and(|s| s.contains("alpha"))
    }

    pub fn is_beta(&self) -> bool {
        self.special.as_deref().is_some_and(|s| s.contains("beta"))
    }

    /// The exact string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Fail with `ProtocolVersionMismatch` unless `self` equals `expected`.
    pub fn ensure_matches(&self, expected: &Version) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(IpcError::ProtocolVersionMismatch {
                expected: expected.to_string(),
                actual: self.to_string(),
            })
        }
    }
}

/// Compare one position: numeric prefix first, then a digits-only position
/// beats one with a suffix, then the suffixes compare ordinally.
fn compare_segments(lhs: &str, rhs: &str) -> Ordering {
    let (lhs_number, lhs_suffix) = split_numeric_prefix(lhs);
    let (rhs_number, rhs_suffix) = split_numeric_prefix(rhs);

    lhs_number.cmp(&rhs_number).then_with(|| match (lhs_suffix, rhs_suffix) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(l), Some(r)) => l.cmp(r),
    })
}

fn split_numeric_prefix(segment: &str) -> (u32, Option<&str>) {
    match segment.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (segment[..pos].parse().unwrap_or(0), Some(&segment[pos..])),
        None => (segment.parse().unwrap_or(0), None),
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.original == other.original {
            return Ordering::Equal;
        }

        let shared = self.numeric_parts.min(other.numeric_parts);
        for i in 0..shared {
            if self.numbers[i] != other.numbers[i] {
                return self.numbers[i].cmp(&other.numbers[i]);
            }
        }

        (1..PART_COUNT)
            .map(|i| compare_segments(&self.segments[i], &other.segments[i]))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl FromStr for Version {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

/// Wire form of a `Version`, as returned by the `handshake` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub build: u32,
    #[serde(default)]
    pub protocol_revision: u32,
}

impl From<Version> for VersionInfo {
    fn from(version: Version) -> Self {
        Self::from(&version)
    }
}

impl From<&Version> for VersionInfo {
    fn from(version: &Version) -> Self {
        Self {
            version: version.original.clone(),
            major: version.major(),
            minor: version.minor(),
            build: version.build(),
            protocol_revision: version.protocol_revision(),
        }
    }
}

impl TryFrom<VersionInfo> for Version {
    type Error = IpcError;

    fn try_from(info: VersionInfo) -> Result<Self> {
        Version::parse(&info.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_components() {
        let version = v("1.2.3.4");
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 2);
        assert_eq!(version.build(), 3);
        assert_eq!(version.protocol_revision(), 4);
        assert!(!version.is_unstable());
    }

    #[test]
    fn test_parse_partial() {
        let version = v("7");
        assert_eq!(version.major(), 7);
        assert_eq!(version.minor(), 0);
        assert_eq!(version.protocol_revision(), 0);
    }

    #[test]
    fn test_parse_rejects_non_numeric_major() {
        assert!(matches!(
            Version::parse("beta"),
            Err(IpcError::Validation { .. })
        ));
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_special_token_stops_numeric_parsing() {
        let version = v("1.1.0-beta.5");
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 1);
        assert_eq!(version.build(), 0);
        assert_eq!(version.protocol_revision(), 0);
        assert_eq!(version.special(), Some("0-beta"));
        assert!(version.is_beta());
        assert!(!version.is_alpha());
        assert!(version.is_unstable());
    }

    #[test]
    fn test_ordering_numeric() {
        assert!(v("1.2.3.4") > v("1.2.3.3"));
        assert!(v("2.0") > v("1.9.9.9"));
        assert!(v("1.10") > v("1.9"));
    }

    #[test]
    fn test_suffix_sorts_lower() {
        assert!(v("1.1.0-beta") < v("1.1.0"));
        assert!(v("2.0alpha") < v("2.0"));
        assert!(v("1.1.0-alpha") < v("1.1.0-beta"));
    }

    #[test]
    fn test_equality() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1.0"), v("1.0"));
        assert_ne!(v("1.0"), v("1.0.1"));
    }

    #[test]
    fn test_round_trip_display() {
        for input in ["1.2.3.4", "1.1.0-beta", "3", "10.0rc1", " 4.2 "] {
            assert_eq!(v(input).to_string(), input);
        }
    }

    #[test]
    fn test_new() {
        let version = Version::new(1, 0, 0, 3);
        assert_eq!(version.to_string(), "1.0.0.3");
        assert_eq!(version.protocol_revision(), 3);
        assert_eq!(version, v("1.0.0.3"));
    }

    #[test]
    fn test_serde_uses_version_info() {
        let json = serde_json::to_value(v("1.2.3.4")).unwrap();
        assert_eq!(json["version"], "1.2.3.4");
        assert_eq!(json["protocolRevision"], 4);

        let back: Version = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_str(), "1.2.3.4");
    }

    #[test]
    fn test_ensure_matches() {
        assert!(v("1.0.0.1").ensure_matches(&v("1.0.0.1")).is_ok());
        assert!(matches!(
            v("1.0.0.2").ensure_matches(&v("1.0.0.1")),
            Err(IpcError::ProtocolVersionMismatch { .. })
        ));
    }
}
