//! Partition access and the low-level write primitive.
//!
//! [`FlashPartitions`] is the narrow seam to the device's partition table and
//! boot pointer. [`PartitionWriter`] layers the begin/write/end/abort protocol
//! on top of it: sectors are erased lazily as the write cursor advances, and a
//! successful `end` on an application slot marks it as the boot target.
//!
//! [`MemoryFlash`] is a NOR-flash simulation (erased state `0xFF`, writes can
//! only clear bits) used by the host agent and the test suite.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpdateError;

/// Default erase sector size in bytes.
pub const SECTOR_SIZE: usize = 4096;

/// The two flashable regions an update can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateTarget {
    /// Application image (next OTA slot)
    Firmware,
    /// Auxiliary data / filesystem image
    Filesystem,
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firmware => write!(f, "firmware"),
            Self::Filesystem => write!(f, "filesystem"),
        }
    }
}

/// Partition role in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    App,
    Data,
}

/// A fixed-size region of flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub label: String,
    pub kind: PartitionKind,
    /// Absolute flash address of the first byte
    pub address: u64,
    pub size: u64,
}

/// Device partition table and boot pointer.
pub trait FlashPartitions: Send {
    /// Erase granularity in bytes.
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Partition an update for `target` must be written to.
    ///
    /// For [`UpdateTarget::Firmware`] this is the OTA slot following the
    /// running one; for [`UpdateTarget::Filesystem`] the last data partition.
    fn partition(&self, target: UpdateTarget) -> Option<PartitionInfo>;

    /// Partition the device is currently executing from.
    fn running_partition(&self) -> Option<PartitionInfo>;

    /// Partition that will execute on next start.
    fn boot_partition(&self) -> Option<PartitionInfo>;

    /// Persist a new boot pointer.
    fn set_boot_partition(&mut self, partition: &PartitionInfo) -> Result<(), UpdateError>;

    /// Read `buf.len()` bytes at `offset` within the partition.
    fn read(&self, partition: &PartitionInfo, offset: u64, buf: &mut [u8])
        -> Result<(), UpdateError>;

    /// Program `data` at `offset`; the range must have been erased.
    fn write(&mut self, partition: &PartitionInfo, offset: u64, data: &[u8])
        -> Result<(), UpdateError>;

    /// Erase `len` bytes at `offset` (sector aligned).
    fn erase(&mut self, partition: &PartitionInfo, offset: u64, len: u64)
        -> Result<(), UpdateError>;
}

/// Progress callback type: `(bytes_written, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Begin/write/end/abort over one partition.
///
/// Exactly one writer exists per active transfer; it borrows the partition
/// table mutably for its whole lifetime.
pub struct PartitionWriter<'a> {
    flash: &'a mut dyn FlashPartitions,
    target: UpdateTarget,
    partition: PartitionInfo,
    /// Declared image length, `None` while unknown (compressed stream)
    expected: Option<u64>,
    written: u64,
    /// Everything below this offset has been erased
    erased_to: u64,
    progress: Option<ProgressCallback>,
}

impl<'a> PartitionWriter<'a> {
    /// Select the partition for `target` and check it can hold `expected` bytes.
    pub fn begin(
        flash: &'a mut dyn FlashPartitions,
        target: UpdateTarget,
        expected: Option<u64>,
    ) -> Result<Self, UpdateError> {
        let partition = flash
            .partition(target)
            .ok_or(UpdateError::PartitionNotFound(target))?;

        if let Some(len) = expected {
            if len == 0 || len > partition.size {
                warn!(
                    update_target = %target,
                    required = len,
                    available = partition.size,
                    "Partition cannot hold the image"
                );
                return Err(UpdateError::InsufficientSpace {
                    target,
                    required: len,
                    available: partition.size,
                });
            }
        }

        debug!(
            update_target = %target,
            label = %partition.label,
            address = format_args!("{:#x}", partition.address),
            expected = ?expected,
            "Partition writer begun"
        );

        Ok(Self {
            flash,
            target,
            partition,
            expected,
            written: 0,
            erased_to: 0,
            progress: None,
        })
    }

    /// Install a progress callback, invoked after every write.
    pub fn set_progress(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    pub fn target(&self) -> UpdateTarget {
        self.target
    }

    pub fn partition(&self) -> &PartitionInfo {
        &self.partition
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn sector_size(&self) -> usize {
        self.flash.sector_size()
    }

    /// Upper bound for the image: declared length or the whole partition.
    pub fn capacity(&self) -> u64 {
        self.expected.unwrap_or(self.partition.size)
    }

    /// Bytes still expected, `None` when the length is unknown.
    pub fn remaining(&self) -> Option<u64> {
        self.expected.map(|e| e.saturating_sub(self.written))
    }

    /// Append `data` to the image.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, UpdateError> {
        if data.is_empty() {
            return Ok(0);
        }

        let end = self.written + data.len() as u64;
        if end > self.capacity() {
            return Err(UpdateError::PartitionOverflow {
                offset: self.written,
                len: data.len(),
                size: self.capacity(),
            });
        }

        // Erase whole sectors ahead of the cursor.
        let sector = self.flash.sector_size() as u64;
        while self.erased_to < end {
            let len = sector.min(self.partition.size - self.erased_to);
            self.flash.erase(&self.partition, self.erased_to, len)?;
            self.erased_to += len;
        }

        self.flash.write(&self.partition, self.written, data)?;
        self.written = end;

        if let Some(progress) = &self.progress {
            progress(self.written, self.capacity());
        }

        Ok(data.len())
    }

    /// Finish the image.
    ///
    /// When the declared length is known, a short image is rejected and the
    /// partition is neutralised. On success an application slot is marked as
    /// the boot target.
    pub fn end(self) -> Result<PartitionInfo, UpdateError> {
        if let Some(expected) = self.expected {
            if self.written != expected {
                let written = self.written;
                self.abort();
                return Err(UpdateError::ShortWrite { written, expected });
            }
        } else if self.written == 0 {
            self.abort();
            return Err(UpdateError::ShortWrite {
                written: 0,
                expected: 0,
            });
        }

        if self.target == UpdateTarget::Firmware {
            self.flash.set_boot_partition(&self.partition)?;
        }

        info!(
            update_target = %self.target,
            label = %self.partition.label,
            bytes = self.written,
            "Partition write finished"
        );
        Ok(self.partition)
    }

    /// Drop the update and invalidate the first sector so it cannot boot.
    pub fn abort(self) {
        warn!(
            update_target = %self.target,
            label = %self.partition.label,
            written = self.written,
            "Aborting partition write"
        );
        if self.written > 0 {
            let len = (self.flash.sector_size() as u64).min(self.partition.size);
            if let Err(e) = self.flash.erase(&self.partition, 0, len) {
                warn!(error = %e, "Failed to neutralise aborted partition");
            }
        }
    }
}

/// One recorded operation of [`MemoryFlash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase { label: String, offset: u64, len: u64 },
    Write { label: String, offset: u64, len: usize },
    SetBoot { label: String },
}

/// In-memory partition table: two OTA application slots and one data partition.
pub struct MemoryFlash {
    sector_size: usize,
    partitions: Vec<PartitionInfo>,
    storage: Vec<Vec<u8>>,
    running: usize,
    boot: usize,
    journal: Vec<FlashOp>,
}

impl MemoryFlash {
    /// Create a table with `ota_0`, `ota_1` of `app_size` bytes and a
    /// `spiffs` data partition of `data_size` bytes, running from `ota_0`.
    pub fn new(app_size: u64, data_size: u64) -> Self {
        Self::with_sector_size(app_size, data_size, SECTOR_SIZE)
    }

    pub fn with_sector_size(app_size: u64, data_size: u64, sector_size: usize) -> Self {
        let base = 0x10000;
        let partitions = vec![
            PartitionInfo {
                label: "ota_0".to_string(),
                kind: PartitionKind::App,
                address: base,
                size: app_size,
            },
            PartitionInfo {
                label: "ota_1".to_string(),
                kind: PartitionKind::App,
                address: base + app_size,
                size: app_size,
            },
            PartitionInfo {
                label: "spiffs".to_string(),
                kind: PartitionKind::Data,
                address: base + 2 * app_size,
                size: data_size,
            },
        ];
        let storage = partitions
            .iter()
            .map(|p| vec![0xFF; p.size as usize])
            .collect();

        Self {
            sector_size,
            partitions,
            storage,
            running: 0,
            boot: 0,
            journal: Vec::new(),
        }
    }

    /// Pretend the device booted from `label`.
    pub fn set_running(&mut self, label: &str) -> bool {
        match self.index_of(label) {
            Some(index) if self.partitions[index].kind == PartitionKind::App => {
                self.running = index;
                self.boot = index;
                true
            }
            _ => false,
        }
    }

    /// Raw contents of a partition.
    pub fn contents(&self, label: &str) -> Option<&[u8]> {
        self.index_of(label).map(|i| self.storage[i].as_slice())
    }

    /// Every operation performed so far, oldest first.
    pub fn journal(&self) -> &[FlashOp] {
        &self.journal
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    fn index_of(&self, label: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.label == label)
    }

    fn locate(
        &self,
        partition: &PartitionInfo,
        offset: u64,
        len: u64,
    ) -> Result<(usize, std::ops::Range<usize>), UpdateError> {
        let index = self
            .index_of(&partition.label)
            .ok_or_else(|| UpdateError::FlashError(format!("unknown partition {}", partition.label)))?;
        let size = self.partitions[index].size;
        if offset + len > size {
            return Err(UpdateError::PartitionOverflow {
                offset,
                len: len as usize,
                size,
            });
        }
        Ok((index, offset as usize..(offset + len) as usize))
    }
}

impl FlashPartitions for MemoryFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn partition(&self, target: UpdateTarget) -> Option<PartitionInfo> {
        match target {
            UpdateTarget::Firmware => {
                let apps: Vec<usize> = (0..self.partitions.len())
                    .filter(|&i| self.partitions[i].kind == PartitionKind::App)
                    .collect();
                let pos = apps.iter().position(|&i| i == self.running)?;
                let next = apps[(pos + 1) % apps.len()];
                (next != self.running).then(|| self.partitions[next].clone())
            }
            UpdateTarget::Filesystem => self
                .partitions
                .iter()
                .rev()
                .find(|p| p.kind == PartitionKind::Data)
                .cloned(),
        }
    }

    fn running_partition(&self) -> Option<PartitionInfo> {
        self.partitions.get(self.running).cloned()
    }

    fn boot_partition(&self) -> Option<PartitionInfo> {
        self.partitions.get(self.boot).cloned()
    }

    fn set_boot_partition(&mut self, partition: &PartitionInfo) -> Result<(), UpdateError> {
        let index = self
            .index_of(&partition.label)
            .filter(|&i| self.partitions[i].kind == PartitionKind::App)
            .ok_or_else(|| {
                UpdateError::FlashError(format!("{} is not bootable", partition.label))
            })?;
        self.boot = index;
        self.journal.push(FlashOp::SetBoot {
            label: partition.label.clone(),
        });
        Ok(())
    }

    fn read(
        &self,
        partition: &PartitionInfo,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), UpdateError> {
        let (index, range) = self.locate(partition, offset, buf.len() as u64)?;
        buf.copy_from_slice(&self.storage[index][range]);
        Ok(())
    }

    fn write(
        &mut self,
        partition: &PartitionInfo,
        offset: u64,
        data: &[u8],
    ) -> Result<(), UpdateError> {
        let (index, range) = self.locate(partition, offset, data.len() as u64)?;
        // NOR semantics: programming can only clear bits.
        for (cell, byte) in self.storage[index][range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.journal.push(FlashOp::Write {
            label: partition.label.clone(),
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn erase(&mut self, partition: &PartitionInfo, offset: u64, len: u64) -> Result<(), UpdateError> {
        let (index, range) = self.locate(partition, offset, len)?;
        self.storage[index][range].fill(0xFF);
        self.journal.push(FlashOp::Erase {
            label: partition.label.clone(),
            offset,
            len,
        });
        Ok(())
    }
}
