//! Error types for the update engine.

use thiserror::Error;

use crate::flash::UpdateTarget;

/// Reason code reported to `on_check_fail` when the written partition cannot be found.
pub const CHECK_FAIL_PARTITION_NOT_FOUND: i32 = -1;

/// Reason code reported to `on_check_fail` when the image signature does not verify.
pub const CHECK_FAIL_VALIDATION_FAILED: i32 = -2;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// No manifest URL configured
    #[error("no manifest URL configured")]
    NoManifestUrl,

    /// Strict TLS requested without a usable root certificate
    #[error("a strict security context was requested but no usable root CA was provided")]
    MissingRootCa,

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Network reported as down by the device
    #[error("network not connected")]
    NotConnected,

    /// Fetch completed with a status other than 200 or 301
    #[error("request failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Response carried no content or an unusable content type
    #[error("empty or invalid response (length: {length:?}, content type: {content_type:?})")]
    InvalidResponse {
        length: Option<u64>,
        content_type: Option<String>,
    },

    /// Stream produced no data within the configured timeout
    #[error("stream timed out after {timeout_ms} ms")]
    StreamTimeout { timeout_ms: u64 },

    /// Network error during a transfer
    #[error("network error: {0}")]
    NetworkError(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Manifest document is neither an object nor an array
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Manifest exceeded the configured size cap
    #[error("manifest too large: {size} bytes (limit {limit})")]
    ManifestTooLarge { size: u64, limit: usize },

    /// No eligible firmware URL is known for the target
    #[error("no URL resolved for {0}")]
    NoTargetUrl(UpdateTarget),

    /// Data partition update refused because trust material lives on it
    #[error("refusing to overwrite the data partition while crypto assets are file-backed")]
    FilesystemInUse,

    /// Payload shorter than the signature block it must carry
    #[error("malformed signature and firmware combination ({length} bytes)")]
    MalformedSignedPayload { length: u64 },

    /// Length unknown while the payload is not compressed
    #[error("payload length is unknown for an uncompressed image")]
    UnknownLength,

    /// Compressed and signed images cannot be combined
    #[error("compressed and signed images are not supported together")]
    CompressedSignedUnsupported,

    /// Partition refused the update (missing or too small)
    #[error("not enough space to begin {target} update: need {required} bytes, partition holds {available}")]
    InsufficientSpace {
        target: UpdateTarget,
        required: u64,
        available: u64,
    },

    /// No partition exists for the requested target
    #[error("no partition available for {0}")]
    PartitionNotFound(UpdateTarget),

    /// Fewer bytes written than expected
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: u64, expected: u64 },

    /// Write would overflow the partition
    #[error("write of {len} bytes at offset {offset} exceeds partition size {size}")]
    PartitionOverflow { offset: u64, len: usize, size: u64 },

    /// Low-level flash failure
    #[error("flash error: {0}")]
    FlashError(String),

    /// Decompression failed
    #[error("inflate error: {0}")]
    Inflate(#[from] crate::inflate::InflateError),

    /// Public key missing or empty
    #[error("public key empty, can't validate")]
    PublicKeyUnavailable,

    /// Public key does not parse as an RSA key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature did not verify against the written image
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Numeric diagnostic for callers that only surface a code.
    ///
    /// Transport failures propagate the HTTP status; everything else maps to a
    /// small negative code grouped by failure class.
    pub fn diagnostic_code(&self) -> i32 {
        match self {
            Self::DownloadFailed { status } => i32::from(*status),
            Self::NoManifestUrl | Self::MissingRootCa | Self::ConfigError(_) => -10,
            Self::NotConnected
            | Self::StreamTimeout { .. }
            | Self::NetworkError(_)
            | Self::HttpError(_)
            | Self::InvalidResponse { .. } => -20,
            Self::InvalidManifest(_)
            | Self::ManifestTooLarge { .. }
            | Self::NoTargetUrl(_)
            | Self::VersionParseError(_)
            | Self::JsonError(_) => -30,
            Self::FilesystemInUse
            | Self::InsufficientSpace { .. }
            | Self::PartitionNotFound(_)
            | Self::PartitionOverflow { .. } => -40,
            Self::MalformedSignedPayload { .. }
            | Self::UnknownLength
            | Self::CompressedSignedUnsupported
            | Self::ShortWrite { .. }
            | Self::Inflate(_) => -50,
            Self::PublicKeyUnavailable | Self::InvalidPublicKey(_) => -60,
            Self::SignatureMismatch => CHECK_FAIL_VALIDATION_FAILED,
            Self::FlashError(_) | Self::IoError(_) => -70,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}

impl From<toml::de::Error> for UpdateError {
    fn from(err: toml::de::Error) -> Self {
        UpdateError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_failed_propagates_status() {
        let err = UpdateError::DownloadFailed { status: 404 };
        assert_eq!(err.diagnostic_code(), 404);
        assert_eq!(err.to_string(), "request failed with status 404");
    }

    #[test]
    fn test_signature_mismatch_code() {
        assert_eq!(
            UpdateError::SignatureMismatch.diagnostic_code(),
            CHECK_FAIL_VALIDATION_FAILED
        );
    }

    #[test]
    fn test_short_write_message() {
        let err = UpdateError::ShortWrite {
            written: 10,
            expected: 20,
        };
        assert_eq!(err.to_string(), "short write: wrote 10 of 20 bytes");
        assert_eq!(err.diagnostic_code(), -50);
    }
}
