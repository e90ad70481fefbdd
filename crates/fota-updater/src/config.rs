//! Configuration structures for the update agent.
//!
//! Loaded from TOML. Every field has a default so a minimal file only names
//! the firmware type, version and manifest URL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asset::CryptoAsset;
use crate::error::UpdateError;
use crate::manifest::SelectionPolicy;
use crate::signature::DEFAULT_SIGNATURE_LEN;
use crate::version::FirmwareVersion;

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Firmware type tag, matched exactly against manifest `type`
    #[serde(default = "default_firmware_type")]
    pub firmware_type: String,

    /// Version of the running firmware
    #[serde(default)]
    pub firmware_version: FirmwareVersion,

    /// Where to fetch the manifest from
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Append `id=<device id>` to the manifest URL
    #[serde(default)]
    pub use_device_id: bool,

    /// How to choose among several eligible manifest entries
    #[serde(default)]
    pub selection_policy: SelectionPolicy,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware_type: default_firmware_type(),
            firmware_version: FirmwareVersion::ZERO,
            manifest_url: None,
            use_device_id: false,
            selection_policy: SelectionPolicy::default(),
            security: SecurityConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.firmware_type.is_empty() {
            return Err(UpdateError::ConfigError("firmware_type is empty".to_string()));
        }
        if self.security.check_signature {
            if self.security.signature_len == 0 {
                return Err(UpdateError::ConfigError(
                    "signature_len must be positive".to_string(),
                ));
            }
            if self.security.pub_key.is_none() {
                return Err(UpdateError::ConfigError(
                    "check_signature requires pub_key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Trust material and verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Verify an RSA signature block in front of every payload
    #[serde(default)]
    pub check_signature: bool,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub allow_insecure_https: bool,

    /// Signature block length in bytes
    #[serde(default = "default_signature_len")]
    pub signature_len: usize,

    /// RSA public key for payload signatures
    #[serde(default)]
    pub pub_key: Option<AssetSource>,

    /// Root CA for `https` URLs
    #[serde(default)]
    pub root_ca: Option<AssetSource>,

    /// Mount point of the filesystem holding file-backed assets
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check_signature: false,
            allow_insecure_https: false,
            signature_len: default_signature_len(),
            pub_key: None,
            root_ca: None,
            cert_dir: default_cert_dir(),
        }
    }
}

impl SecurityConfig {
    pub fn pub_key_asset(&self) -> Option<CryptoAsset> {
        self.pub_key
            .as_ref()
            .map(|source| source.to_asset("pub_key", &self.cert_dir))
    }

    pub fn root_ca_asset(&self) -> Option<CryptoAsset> {
        self.root_ca
            .as_ref()
            .map(|source| source.to_asset("root_ca", &self.cert_dir))
    }
}

/// Where a piece of trust material comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetSource {
    /// File relative to the certificate filesystem
    Path { path: PathBuf },
    /// Inline PEM text
    Pem { pem: String },
}

impl AssetSource {
    pub fn to_asset(&self, name: &str, cert_dir: &Path) -> CryptoAsset {
        match self {
            Self::Path { path } => CryptoAsset::from_file(cert_dir, path),
            Self::Pem { pem } => CryptoAsset::from_memory(name, pem.as_bytes().to_vec()),
        }
    }
}

/// Payload source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Http,
    File,
}

/// Network configuration for transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Payload source
    #[serde(default)]
    pub stream_type: StreamType,

    /// Base directory for `file` streams
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,

    /// How long to wait for payload data before giving up, in milliseconds
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_ms: u64,

    /// Largest manifest accepted, in bytes
    #[serde(default = "default_manifest_max_bytes")]
    pub manifest_max_bytes: usize,

    /// Headers sent with every request (e.g. `Authorization`)
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stream_type: StreamType::default(),
            file_root: default_file_root(),
            stream_timeout_ms: default_stream_timeout(),
            manifest_max_bytes: default_manifest_max_bytes(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl NetworkConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// Default value functions for serde
fn default_firmware_type() -> String {
    "esp32-fota-http".to_string()
}

fn default_signature_len() -> usize {
    DEFAULT_SIGNATURE_LEN
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_stream_timeout() -> u64 {
    10_000
}

fn default_manifest_max_bytes() -> usize {
    16 * 1024
}
