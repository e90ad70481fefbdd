//! Update manager - drives one check-and-update cycle.
//!
//! The UpdateManager combines the update components:
//! - ManifestEvaluator for choosing an eligible manifest entry
//! - TransferEngine for streaming payloads into partitions
//! - SignatureVerifier for validating what landed in flash
//! - FlashPartitions and Device for the boot pointer, watchdog and restart
//!
//! Each target moves through
//!
//! ```text
//! Idle → SelectingTarget → Begun → Writing → Ended → [Validating] → Bootable | Rejected
//! ```
//!
//! The filesystem target always runs to completion before the firmware
//! target begins, and only the firmware target restarts the device.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::asset::CryptoAsset;
use crate::config::{StreamType, UpdateConfig};
use crate::device::Device;
use crate::error::{UpdateError, CHECK_FAIL_PARTITION_NOT_FOUND, CHECK_FAIL_VALIDATION_FAILED};
use crate::flash::{FlashPartitions, UpdateTarget};
use crate::hooks::UpdateHooks;
use crate::manifest::{self, ManifestEntry, ManifestEvaluator};
use crate::signature::SignatureVerifier;
use crate::transfer::{CommittedImage, TransferEngine, TransferPlan};
use crate::transport::{FileTransport, HttpTransport, Transport};
use crate::version::FirmwareVersion;

/// Where a target currently is in its update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePhase {
    /// No update in progress
    #[default]
    Idle,
    /// Resolving the URL and partition for a target
    SelectingTarget,
    /// Partition accepted the declared length
    Begun,
    /// Payload bytes are streaming into flash
    Writing,
    /// Partition released, successfully or not
    Ended,
    /// Checking the signature of the written partition
    Validating,
    /// Image committed and, for firmware, selected for boot
    Bootable,
    /// Signature check failed, partition neutralised
    Rejected,
    /// Optional target without a URL
    Skipped,
    /// Update attempt failed
    Failed,
}

impl UpdatePhase {
    /// Whether the target's update is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Bootable | Self::Rejected | Self::Skipped | Self::Failed
        )
    }
}

/// One recorded phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    pub target: UpdateTarget,
    pub phase: UpdatePhase,
}

fn record_phase(log: &mut Vec<PhaseRecord>, target: UpdateTarget, phase: UpdatePhase) {
    debug!(update_target = %target, ?phase, "Update phase");
    log.push(PhaseRecord { target, phase });
}

/// Main update manager.
///
/// # Example
///
/// ```ignore
/// use fota_updater::{MemoryFlash, SimulatedDevice, UpdateConfig, UpdateManager};
///
/// let config = UpdateConfig::load_from_file(path)?;
/// let mut manager = UpdateManager::from_config(config, flash, device)?;
///
/// if manager.check().await? {
///     manager.execute().await?;
/// }
/// ```
pub struct UpdateManager<F: FlashPartitions, D: Device> {
    /// Configuration
    config: UpdateConfig,
    /// Manifest and payload source
    transport: Arc<dyn Transport>,
    /// Partition table of the device
    flash: F,
    /// Connectivity, watchdog and restart
    device: D,
    /// Installed callbacks
    hooks: UpdateHooks,
    /// Key for payload signatures
    pub_key: Option<CryptoAsset>,
    /// Root CA, kept to guard the filesystem holding it
    root_ca: Option<CryptoAsset>,
    /// Entry chosen by the last check
    pending: Option<ManifestEntry>,
    firmware_url: Option<String>,
    filesystem_url: Option<String>,
    /// Phase transitions, oldest first
    phases: Vec<PhaseRecord>,
}

impl<F: FlashPartitions, D: Device> UpdateManager<F, D> {
    /// Create a manager with an explicit transport.
    pub fn new(
        config: UpdateConfig,
        transport: Arc<dyn Transport>,
        flash: F,
        device: D,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let pub_key = config.security.pub_key_asset();
        let root_ca = config.security.root_ca_asset();

        info!(
            firmware_type = %config.firmware_type,
            version = %config.firmware_version,
            check_signature = config.security.check_signature,
            "Update manager created"
        );

        Ok(Self {
            config,
            transport,
            flash,
            device,
            hooks: UpdateHooks::default(),
            pub_key,
            root_ca,
            pending: None,
            firmware_url: None,
            filesystem_url: None,
            phases: Vec::new(),
        })
    }

    /// Create a manager whose transport follows `network.stream_type`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configured root CA is not a
    /// certificate.
    pub fn from_config(config: UpdateConfig, flash: F, device: D) -> Result<Self, UpdateError> {
        let transport: Arc<dyn Transport> = match config.network.stream_type {
            StreamType::Http => {
                let root_ca = config.security.root_ca_asset();
                Arc::new(HttpTransport::new(
                    root_ca.as_ref(),
                    config.security.allow_insecure_https,
                )?)
            }
            StreamType::File => Arc::new(FileTransport::new(config.network.file_root.clone())),
        };
        Self::new(config, transport, flash, device)
    }

    pub fn with_hooks(mut self, hooks: UpdateHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the configured signature key.
    pub fn with_pub_key(mut self, asset: CryptoAsset) -> Self {
        self.pub_key = Some(asset);
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Every phase transition so far, oldest first.
    pub fn phase_log(&self) -> &[PhaseRecord] {
        &self.phases
    }

    /// The latest phase of `target`.
    pub fn phase(&self, target: UpdateTarget) -> UpdatePhase {
        self.phases
            .iter()
            .rev()
            .find(|record| record.target == target)
            .map(|record| record.phase)
            .unwrap_or_default()
    }

    /// Manifest URL, with the device id appended when enabled.
    pub fn manifest_url(&self) -> Option<String> {
        let base = self.config.manifest_url.as_deref()?;
        if !self.config.use_device_id {
            return Some(base.to_string());
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        Some(format!("{}{}id={}", base, separator, self.device.device_id()))
    }

    /// Entry chosen by the last check.
    pub fn pending_update(&self) -> Option<&ManifestEntry> {
        self.pending.as_ref()
    }

    pub fn payload_version(&self) -> Option<FirmwareVersion> {
        self.pending.as_ref().map(|entry| entry.version)
    }

    pub fn payload_version_major(&self) -> Option<u64> {
        self.payload_version().map(|version| version.major)
    }

    pub fn firmware_url(&self) -> Option<&str> {
        self.firmware_url.as_deref()
    }

    pub fn filesystem_url(&self) -> Option<&str> {
        self.filesystem_url.as_deref()
    }

    /// Fetch the manifest and pick an update.
    ///
    /// Returns `true` when an entry is eligible; its URLs are then available
    /// through [`firmware_url`](Self::firmware_url) and
    /// [`filesystem_url`](Self::filesystem_url).
    ///
    /// # Errors
    ///
    /// - `NoManifestUrl` / `NotConnected` before any request
    /// - transport errors and `DownloadFailed`
    /// - `ManifestTooLarge` or `InvalidManifest` for the document itself
    pub async fn check(&mut self) -> Result<bool, UpdateError> {
        let evaluator = self.evaluator();
        self.check_with(evaluator).await
    }

    /// Check, then execute when an update is available.
    pub async fn handle(&mut self) -> Result<bool, UpdateError> {
        if !self.check().await? {
            debug!("No update available");
            return Ok(false);
        }
        self.execute().await?;
        Ok(true)
    }

    /// Install the resolved images: filesystem first, then firmware.
    ///
    /// Only the firmware update restarts the device.
    pub async fn execute(&mut self) -> Result<(), UpdateError> {
        let validate = self.config.security.check_signature;
        self.execute_with(validate).await
    }

    /// Update one target from its resolved URL.
    ///
    /// Returns the final phase: `Skipped` for a filesystem target without a
    /// URL, `Bootable` on success.
    pub async fn update_target(
        &mut self,
        target: UpdateTarget,
        restart_after: bool,
    ) -> Result<UpdatePhase, UpdateError> {
        let validate = self.config.security.check_signature;
        self.run_target(target, restart_after, validate).await
    }

    /// Install firmware from `url`, bypassing the manifest.
    pub async fn force_update_url(&mut self, url: &str, validate: bool) -> Result<(), UpdateError> {
        info!(url, validate, "Forced firmware update");
        self.pending = None;
        self.firmware_url = Some(url.to_string());
        self.filesystem_url = None;
        self.execute_with(validate).await
    }

    /// Install firmware from `host:port` + `path`; ports 443 and 4433 use https.
    pub async fn force_update_host(
        &mut self,
        host: &str,
        port: u16,
        path: &str,
        validate: bool,
    ) -> Result<(), UpdateError> {
        let url = manifest::resource_url(host, port, path);
        self.force_update_url(&url, validate).await
    }

    /// Install the manifest's entry for this firmware type at any version.
    pub async fn force_update(&mut self, validate: bool) -> Result<(), UpdateError> {
        let evaluator = self.evaluator().ignoring_version();
        if !self.check_with(evaluator).await? {
            warn!("Forced update found no entry for this firmware type");
            return Err(UpdateError::NoTargetUrl(UpdateTarget::Firmware));
        }
        self.execute_with(validate).await
    }

    /// Install a filesystem image from `url`, then restart.
    pub async fn force_update_filesystem(
        &mut self,
        url: &str,
        validate: bool,
    ) -> Result<(), UpdateError> {
        info!(url, validate, "Forced filesystem update");
        self.filesystem_url = Some(url.to_string());
        self.run_target(UpdateTarget::Filesystem, true, validate)
            .await
            .map(|_| ())
    }

    fn evaluator(&self) -> ManifestEvaluator {
        ManifestEvaluator::new(
            self.config.firmware_type.clone(),
            self.config.firmware_version,
        )
        .with_policy(self.config.selection_policy)
    }

    async fn check_with(&mut self, evaluator: ManifestEvaluator) -> Result<bool, UpdateError> {
        self.pending = None;
        self.firmware_url = None;
        self.filesystem_url = None;

        let document = self.fetch_manifest().await?;
        let Some(entry) = evaluator.evaluate(&document) else {
            return Ok(false);
        };

        debug!(secure = entry.secure, "Resolved update URLs");
        self.firmware_url = Some(entry.firmware_url.clone());
        self.filesystem_url = entry.filesystem_url.clone();
        self.pending = Some(entry);
        Ok(true)
    }

    async fn fetch_manifest(&self) -> Result<Value, UpdateError> {
        let url = self.manifest_url().ok_or(UpdateError::NoManifestUrl)?;
        if !self.device.is_connected() {
            warn!("Network is down, skipping manifest check");
            return Err(UpdateError::NotConnected);
        }

        debug!("Fetching manifest: {}", url);
        let response = self
            .transport
            .fetch(&url, &self.config.network.headers())
            .await?;
        if !response.is_success() {
            warn!(status = response.status, url = %url, "Manifest request failed");
            return Err(UpdateError::DownloadFailed {
                status: response.status,
            });
        }

        let limit = self.config.network.manifest_max_bytes;
        if let Some(length) = response.content_length {
            if length > limit as u64 {
                return Err(UpdateError::ManifestTooLarge {
                    size: length,
                    limit,
                });
            }
        }

        let mut body = Vec::new();
        let mut reader = response.body.take((limit as u64).saturating_add(1));
        tokio::time::timeout(
            self.config.network.stream_timeout(),
            reader.read_to_end(&mut body),
        )
        .await
        .map_err(|_| UpdateError::StreamTimeout {
            timeout_ms: self.config.network.stream_timeout_ms,
        })??;

        if body.len() > limit {
            return Err(UpdateError::ManifestTooLarge {
                size: body.len() as u64,
                limit,
            });
        }
        manifest::parse_document(&body)
    }

    async fn execute_with(&mut self, validate: bool) -> Result<(), UpdateError> {
        if self.filesystem_url.is_some() {
            self.run_target(UpdateTarget::Filesystem, false, validate)
                .await?;
        } else {
            debug!("Update is for the firmware partition only");
        }
        self.run_target(UpdateTarget::Firmware, true, validate)
            .await
            .map(|_| ())
    }

    async fn run_target(
        &mut self,
        target: UpdateTarget,
        restart_after: bool,
        validate: bool,
    ) -> Result<UpdatePhase, UpdateError> {
        record_phase(&mut self.phases, target, UpdatePhase::SelectingTarget);

        let url = match target {
            UpdateTarget::Firmware => self.firmware_url.clone(),
            UpdateTarget::Filesystem => self.filesystem_url.clone(),
        };
        let Some(url) = url else {
            if target == UpdateTarget::Filesystem {
                info!("[SKIP] No filesystem image was specified");
                record_phase(&mut self.phases, target, UpdatePhase::Skipped);
                return Ok(UpdatePhase::Skipped);
            }
            error!("No firmware image was specified");
            return self.fail(target, UpdateError::NoTargetUrl(target));
        };

        if target == UpdateTarget::Filesystem && self.trust_store_on_flash() {
            error!(
                url = %url,
                root = ?self.trust_store_root(),
                "Refusing to overwrite the filesystem holding the certificates and keys"
            );
            return self.fail(target, UpdateError::FilesystemInUse);
        }

        let verifier = if validate {
            let Some(asset) = self.pub_key.as_ref() else {
                self.hooks.check_failed(target, CHECK_FAIL_VALIDATION_FAILED);
                return self.fail(target, UpdateError::PublicKeyUnavailable);
            };
            match SignatureVerifier::new(asset, self.config.security.signature_len) {
                Ok(verifier) => Some(verifier),
                Err(e) => {
                    self.hooks.check_failed(target, CHECK_FAIL_VALIDATION_FAILED);
                    return self.fail(target, e);
                }
            }
        } else {
            None
        };

        let image = match self.transfer(target, &url, verifier.as_ref()).await {
            Ok(image) => image,
            Err(e) => {
                if matches!(
                    e,
                    UpdateError::InsufficientSpace { .. } | UpdateError::PartitionNotFound(_)
                ) {
                    warn!(update_target = %target, "Not enough space to begin update");
                    self.hooks.begin_failed(target);
                }
                return self.fail(target, e);
            }
        };
        debug!(update_target = %target, written = image.len, "Write ended");
        self.hooks.write_ended(target);

        if let Some(verifier) = verifier {
            self.validate(&image, &verifier, restart_after)?;
        }

        record_phase(&mut self.phases, target, UpdatePhase::Bootable);
        self.hooks.update_finished(target, restart_after);
        info!(update_target = %target, restart_after, "Update successfully completed");
        if restart_after {
            info!("Rebooting");
            self.device.restart();
        }
        Ok(UpdatePhase::Bootable)
    }

    async fn transfer(
        &mut self,
        target: UpdateTarget,
        url: &str,
        verifier: Option<&SignatureVerifier>,
    ) -> Result<CommittedImage, UpdateError> {
        let response = self
            .transport
            .fetch(url, &self.config.network.headers())
            .await?;
        let plan = TransferPlan::from_response(target, url, &response)?;
        let mut body = response.body;

        let mut engine = TransferEngine::new(self.config.network.stream_timeout());
        if let Some(verifier) = verifier {
            engine = engine.with_signature(verifier.signature_len());
        }

        let phases = &mut self.phases;
        engine
            .run(
                &plan,
                &mut body,
                &mut self.flash,
                &mut self.device,
                Some(self.hooks.progress()),
                &mut |phase: UpdatePhase| record_phase(phases, target, phase),
            )
            .await
    }

    fn validate(
        &mut self,
        image: &CommittedImage,
        verifier: &SignatureVerifier,
        restart_after: bool,
    ) -> Result<(), UpdateError> {
        let target = image.target;
        record_phase(&mut self.phases, target, UpdatePhase::Validating);
        info!(update_target = %target, label = %image.partition.label, "Checking signature");

        // The writer marked the new slot bootable; keep booting the running
        // image until the signature holds.
        if let Err(e) = self.pin_running(target) {
            error!(update_target = %target, error = %e, "Can't restore the running boot partition");
            return Err(self.reject(image, e, restart_after));
        }

        let signature = image.signature.as_deref().unwrap_or_default();
        if let Err(e) = verifier.verify(&self.flash, &image.partition, signature, image.len) {
            error!(update_target = %target, error = %e, "Signature check failed");
            return Err(self.reject(image, e, restart_after));
        }
        info!(update_target = %target, "Signature check successful");

        if target == UpdateTarget::Firmware {
            if let Err(e) = self.flash.set_boot_partition(&image.partition) {
                error!(label = %image.partition.label, error = %e, "Can't mark verified image bootable");
                return Err(self.reject(image, e, restart_after));
            }
        }
        Ok(())
    }

    fn pin_running(&mut self, target: UpdateTarget) -> Result<(), UpdateError> {
        if target != UpdateTarget::Firmware {
            return Ok(());
        }
        let running = self
            .flash
            .running_partition()
            .ok_or(UpdateError::PartitionNotFound(target))?;
        self.flash.set_boot_partition(&running)
    }

    /// Erases a written image that must not boot and points the device back
    /// at the running slot.
    fn reject(&mut self, image: &CommittedImage, e: UpdateError, restart_after: bool) -> UpdateError {
        let target = image.target;
        let partition = &image.partition;
        let sector = self.flash.sector_size() as u64;
        if let Err(erase) = self
            .flash
            .erase(partition, 0, sector.min(partition.size))
            .and_then(|_| self.flash.erase(partition, 0, partition.size))
        {
            error!(label = %partition.label, error = %erase, "Failed to erase rejected image");
        }
        if let Err(pin) = self.pin_running(target) {
            error!(update_target = %target, error = %pin, "Boot partition left on the erased slot");
        }

        record_phase(&mut self.phases, target, UpdatePhase::Rejected);
        let code = match e {
            UpdateError::PartitionNotFound(_) => CHECK_FAIL_PARTITION_NOT_FOUND,
            _ => CHECK_FAIL_VALIDATION_FAILED,
        };
        self.hooks.check_failed(target, code);
        if restart_after {
            info!("Rebooting into the previous image");
            self.device.restart();
        }
        e
    }

    fn trust_store_on_flash(&self) -> bool {
        [&self.pub_key, &self.root_ca]
            .into_iter()
            .flatten()
            .any(CryptoAsset::is_file_backed)
    }

    fn trust_store_root(&self) -> Option<&Path> {
        [&self.pub_key, &self.root_ca]
            .into_iter()
            .flatten()
            .find_map(CryptoAsset::root)
    }

    fn fail(&mut self, target: UpdateTarget, e: UpdateError) -> Result<UpdatePhase, UpdateError> {
        warn!(update_target = %target, error = %e, "Update failed");
        record_phase(&mut self.phases, target, UpdatePhase::Failed);
        Err(e)
    }
}

impl<F: FlashPartitions, D: Device> std::fmt::Debug for UpdateManager<F, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("firmware_type", &self.config.firmware_type)
            .field("firmware_version", &self.config.firmware_version)
            .field("firmware_url", &self.firmware_url)
            .field("filesystem_url", &self.filesystem_url)
            .field("hooks", &self.hooks)
            .finish()
    }
}
