//! Manifest evaluation.
//!
//! The manifest is a JSON object, or an array of objects, describing
//! available firmware. Each entry is checked against the running firmware:
//!
//! 1. `type` must match the running firmware type exactly
//! 2. `version` is an integer (major only) or a version string; anything
//!    else counts as `0.0.0`
//! 3. the image address is either `url` verbatim or `host` + `port` + `bin`
//! 4. an optional filesystem image path comes from `littlefs`, `spiffs` or
//!    `fatfs`, in that order of preference
//! 5. the entry is eligible when its version is strictly newer
//!
//! Entries missing their address are malformed; evaluation moves on to the
//! next entry of an array.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::version::FirmwareVersion;

/// Filesystem image keys, most preferred first.
const FILESYSTEM_KEYS: [&str; 3] = ["littlefs", "spiffs", "fatfs"];

/// Ports on which the secure scheme is assumed.
pub const SECURE_PORTS: [u16; 2] = [443, 4433];

/// URL scheme inferred from a port number.
///
/// This is a heuristic over well-known ports, not a protocol probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn for_port(port: u16) -> Self {
        if SECURE_PORTS.contains(&port) {
            Self::Https
        } else {
            Self::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build `scheme://host:port/path` with the scheme inferred from the port.
pub fn resource_url(host: &str, port: u16, path: &str) -> String {
    format!("{}://{}:{}{}", Scheme::for_port(port), host, port, path)
}

/// How to pick among several eligible entries of an array manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Stop at the first eligible entry, in document order
    #[default]
    FirstMatch,
    /// Take the greatest eligible version; the earliest entry wins ties
    HighestVersion,
}

/// A resolved manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub firmware_type: String,
    pub version: FirmwareVersion,
    pub firmware_url: String,
    pub filesystem_url: Option<String>,
    /// Whether the address was built with the secure scheme
    pub secure: bool,
}

/// Result of checking one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    TypeMismatch,
    Malformed(String),
    NotNewer(ManifestEntry),
    Eligible(ManifestEntry),
}

impl EntryOutcome {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible(_))
    }
}

/// Applies the eligibility rules for one running firmware.
#[derive(Debug, Clone)]
pub struct ManifestEvaluator {
    firmware_type: String,
    current_version: FirmwareVersion,
    policy: SelectionPolicy,
    ignore_version: bool,
}

impl ManifestEvaluator {
    pub fn new(firmware_type: impl Into<String>, current_version: FirmwareVersion) -> Self {
        Self {
            firmware_type: firmware_type.into(),
            current_version,
            policy: SelectionPolicy::default(),
            ignore_version: false,
        }
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Treat every well-formed, type-matching entry as eligible.
    pub fn ignoring_version(mut self) -> Self {
        self.ignore_version = true;
        self
    }

    /// Check a single manifest entry.
    pub fn evaluate_entry(&self, entry: &Value) -> EntryOutcome {
        let firmware_type = entry.get("type").and_then(Value::as_str);
        if firmware_type != Some(self.firmware_type.as_str()) {
            debug!(
                expected = %self.firmware_type,
                found = ?firmware_type,
                "Manifest entry type mismatch"
            );
            return EntryOutcome::TypeMismatch;
        }

        let version = entry_version(entry);

        let (firmware_url, filesystem_url, secure) = match resolve_address(entry) {
            Ok(address) => address,
            Err(reason) => {
                warn!(reason = %reason, "Malformed manifest entry");
                return EntryOutcome::Malformed(reason);
            }
        };

        let resolved = ManifestEntry {
            firmware_type: self.firmware_type.clone(),
            version,
            firmware_url,
            filesystem_url,
            secure,
        };

        if self.ignore_version || version.is_newer_than(&self.current_version) {
            EntryOutcome::Eligible(resolved)
        } else {
            debug!(
                current = %self.current_version,
                offered = %version,
                "Manifest entry is not newer"
            );
            EntryOutcome::NotNewer(resolved)
        }
    }

    /// Pick the entry to install from a whole manifest document.
    pub fn evaluate(&self, document: &Value) -> Option<ManifestEntry> {
        let entries: Vec<&Value> = match document {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![document],
            _ => {
                warn!("Manifest is neither an object nor an array");
                return None;
            }
        };

        let mut best: Option<ManifestEntry> = None;
        for (index, entry) in entries.into_iter().enumerate() {
            let EntryOutcome::Eligible(candidate) = self.evaluate_entry(entry) else {
                continue;
            };
            debug!(index, version = %candidate.version, "Eligible manifest entry");

            match self.policy {
                SelectionPolicy::FirstMatch => {
                    best = Some(candidate);
                    break;
                }
                SelectionPolicy::HighestVersion => {
                    if best.as_ref().map_or(true, |b| candidate.version > b.version) {
                        best = Some(candidate);
                    }
                }
            }
        }

        match &best {
            Some(entry) => info!(
                version = %entry.version,
                url = %entry.firmware_url,
                filesystem = ?entry.filesystem_url,
                "Update available"
            ),
            None => info!(current = %self.current_version, "No eligible manifest entry"),
        }
        best
    }
}

/// Parse a manifest body into a JSON object or array.
pub fn parse_document(body: &[u8]) -> Result<Value, UpdateError> {
    let document: Value = serde_json::from_slice(body)?;
    if document.is_object() || document.is_array() {
        Ok(document)
    } else {
        Err(UpdateError::InvalidManifest(
            "expected a JSON object or array".to_string(),
        ))
    }
}

fn entry_version(entry: &Value) -> FirmwareVersion {
    match entry.get("version") {
        Some(Value::Number(n)) => match n.as_u64().and_then(|v| u16::try_from(v).ok()) {
            Some(major) => FirmwareVersion::from_major(major),
            None => {
                warn!(version = %n, "Numeric version out of range, using 0.0.0");
                FirmwareVersion::ZERO
            }
        },
        Some(Value::String(text)) => FirmwareVersion::parse(text),
        other => {
            warn!(version = ?other, "Manifest entry has no usable version, using 0.0.0");
            FirmwareVersion::ZERO
        }
    }
}

/// Returns `(firmware_url, filesystem_url, secure)`.
fn resolve_address(entry: &Value) -> Result<(String, Option<String>, bool), String> {
    let field = |key: &str| entry.get(key).and_then(Value::as_str);

    if let Some(url) = field("url") {
        if entry.get("host").is_some() {
            warn!("Manifest entry has both url and host, using url");
        }
        return Ok((url.to_string(), None, url.starts_with("https://")));
    }

    let host = field("host");
    let port = entry
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());
    let bin = field("bin");

    let (Some(host), Some(port), Some(bin)) = (host, port, bin) else {
        return Err(format!(
            "needs url or host/port/bin (host: {}, port: {}, bin: {})",
            host.is_some(),
            port.is_some(),
            bin.is_some()
        ));
    };

    let filesystem_url = FILESYSTEM_KEYS
        .iter()
        .find_map(|key| field(*key))
        .map(|path| resource_url(host, port, path));

    Ok((
        resource_url(host, port, bin),
        filesystem_url,
        Scheme::for_port(port).is_secure(),
    ))
}
