//! # fota-updater
//!
//! Over-the-air firmware updates for devices with A/B application slots.
//!
//! This crate handles:
//! - Manifest evaluation (firmware type gate, version ordering, URL resolution)
//! - Streamed payload transfer with a bounded wait for data
//! - zlib decompression through a 32 KiB wrapping dictionary
//! - RSA/SHA-256 verification of what actually landed in flash
//! - Boot partition switching with rollback on a failed signature
//!
//! ## Safety
//!
//! - An application slot is only selected for boot after its image is complete
//!   and, when signatures are checked, verified
//! - A rejected image has its partition erased before control returns
//! - The filesystem image is always installed before the application image

pub mod asset;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod hooks;
pub mod inflate;
pub mod manager;
pub mod manifest;
#[cfg(test)]
mod proptests;
pub mod signature;
pub mod transfer;
pub mod transport;
pub mod version;

// Re-export main types for convenience
pub use asset::{CryptoAsset, FileAsset, MemoryAsset};
pub use config::{AssetSource, NetworkConfig, SecurityConfig, StreamType, UpdateConfig};
pub use device::{Device, SimulatedDevice};
pub use error::{UpdateError, CHECK_FAIL_PARTITION_NOT_FOUND, CHECK_FAIL_VALIDATION_FAILED};
pub use flash::{
    FlashOp, FlashPartitions, MemoryFlash, PartitionInfo, PartitionKind, PartitionWriter,
    ProgressCallback, UpdateTarget,
};
pub use hooks::UpdateHooks;
pub use inflate::{InflateChunk, InflateError, InflateStats, InflateStatus, Inflator};
pub use manager::{PhaseRecord, UpdateManager, UpdatePhase};
pub use manifest::{
    EntryOutcome, ManifestEntry, ManifestEvaluator, Scheme, SelectionPolicy,
};
pub use signature::SignatureVerifier;
pub use transfer::{CommittedImage, TransferEngine, TransferPlan, TransferSession};
pub use transport::{
    FetchResponse, FileTransport, HttpTransport, MemoryResource, MemoryTransport, PayloadKind,
    PayloadStream, Transport,
};
pub use version::FirmwareVersion;
