//! Firmware version model.
//!
//! Versions are plain `(major, minor, patch)` triples with a total order.
//! Parsing is fail-closed: a malformed string yields `0.0.0` rather than an
//! error, so a single bad manifest entry can never block future updates.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::error::UpdateError;

/// An ordered firmware version triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FirmwareVersion {
    /// Version `0.0.0`, the value every unparseable input collapses to.
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Major-only version, as carried by integer manifest `version` fields.
    pub const fn from_major(major: u16) -> Self {
        Self::new(major as u64, 0, 0)
    }

    /// Parse a version string, falling back to `0.0.0` on malformed input.
    pub fn parse(text: &str) -> Self {
        match Self::try_parse(text) {
            Ok(version) => version,
            Err(e) => {
                warn!(input = text, error = %e, "Invalid version string, defaulting to 0.0.0");
                Self::ZERO
            }
        }
    }

    /// Strict parse.
    ///
    /// Accepts full semantic versions as well as the shortened `1` and `1.2`
    /// forms, with an optional leading `v`. Pre-release and build suffixes are
    /// accepted but do not take part in ordering.
    pub fn try_parse(text: &str) -> Result<Self, UpdateError> {
        let trimmed = text.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

        if let Ok(v) = semver::Version::parse(trimmed) {
            return Ok(Self::from(v));
        }

        // Shortened forms: strip any suffix, then 1-3 numeric components.
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        if core.is_empty() || parts.len() > 3 {
            return Err(UpdateError::VersionParseError(format!(
                "'{}' is not a version",
                text
            )));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(UpdateError::VersionParseError(format!(
                    "'{}' has a non-numeric component",
                    text
                )));
            }
            *slot = part
                .parse()
                .map_err(|_| UpdateError::VersionParseError(format!("'{}' overflows", text)))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }

    /// Lexicographic comparison over `(major, minor, patch)`.
    pub fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    /// Whether `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }
}

impl From<semver::Version> for FirmwareVersion {
    fn from(v: semver::Version) -> Self {
        Self::new(v.major, v.minor, v.patch)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for FirmwareVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FirmwareVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::parse(&text))
    }
}
