//! Transfer engine: one payload stream into one partition.
//!
//! The payload layout is
//!
//! ```text
//! [ signature block (signature_len bytes, signed updates only) ][ image ]
//! ```
//!
//! where the image is either raw firmware or a zlib stream. Compression is
//! only assumed when the first image byte is the zlib magic *and* the
//! resource path carries the `zz` hint.
//!
//! Every wait for stream data is bounded by the stream timeout; running past
//! it fails the transfer. Once a partition has been begun the transfer either
//! lands completely or the partition is neutralised.

use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::UpdateError;
use crate::flash::{FlashPartitions, PartitionInfo, PartitionWriter, ProgressCallback, UpdateTarget};
use crate::inflate::{self, InflateChunk, InflateError, InflateStatus, Inflator, DICT_SIZE};
use crate::manager::UpdatePhase;
use crate::transport::{FetchResponse, PayloadKind, PayloadStream};

/// Default bound on the wait for payload data.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(10_000);

/// What to transfer, derived from a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub target: UpdateTarget,
    pub resource_url: String,
    /// Length reported by the transport, signature block included
    pub declared_len: Option<u64>,
    pub kind: PayloadKind,
}

impl TransferPlan {
    /// Validate a payload response.
    ///
    /// # Errors
    ///
    /// - `DownloadFailed` carrying the status for anything but 200/301
    /// - `InvalidResponse` for an empty body or an unsupported content type
    pub fn from_response(
        target: UpdateTarget,
        resource_url: &str,
        response: &FetchResponse,
    ) -> Result<Self, UpdateError> {
        if !response.is_success() {
            warn!(status = response.status, url = resource_url, "Payload request failed");
            return Err(UpdateError::DownloadFailed {
                status: response.status,
            });
        }

        let invalid = || UpdateError::InvalidResponse {
            length: response.content_length,
            content_type: response.content_type.clone(),
        };

        if response.content_length == Some(0) {
            warn!(url = resource_url, "Payload is empty");
            return Err(invalid());
        }

        let kind = PayloadKind::from_content_type(response.content_type.as_deref()).ok_or_else(|| {
            warn!(content_type = ?response.content_type, "Unsupported payload content type");
            invalid()
        })?;

        Ok(Self {
            target,
            resource_url: resource_url.to_string(),
            declared_len: response.content_length,
            kind,
        })
    }
}

/// Per-transfer state resolved before the partition is begun.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    /// Image bytes the partition must receive, `None` when compressed
    pub expected: Option<u64>,
    pub compressed: bool,
    /// Compressed stream length, when known
    pub compressed_len: Option<u64>,
    pub signature: Option<Vec<u8>>,
}

/// A partition that received a complete image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedImage {
    pub target: UpdateTarget,
    pub partition: PartitionInfo,
    /// Bytes that landed in flash
    pub len: u64,
    pub compressed: bool,
    pub signature: Option<Vec<u8>>,
}

/// Streams payloads into partitions.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    stream_timeout: Duration,
    signature_len: Option<usize>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_TIMEOUT)
    }
}

impl TransferEngine {
    pub fn new(stream_timeout: Duration) -> Self {
        Self {
            stream_timeout,
            signature_len: None,
        }
    }

    /// Expect a `len`-byte signature block in front of every payload.
    pub fn with_signature(mut self, len: usize) -> Self {
        self.signature_len = Some(len);
        self
    }

    pub fn signature_len(&self) -> Option<usize> {
        self.signature_len
    }

    /// Extract the signature and work out the image size and encoding.
    ///
    /// Consumes the signature block from `body`; the image itself is only
    /// peeked.
    pub async fn prepare(
        &self,
        plan: &TransferPlan,
        body: &mut PayloadStream,
    ) -> Result<TransferSession, UpdateError> {
        let mut payload_len = plan.declared_len;
        let mut signature = None;

        if let Some(sig_len) = self.signature_len {
            let declared = plan.declared_len.ok_or(UpdateError::UnknownLength)?;
            if declared <= sig_len as u64 {
                warn!(declared, sig_len, "Malformed signature and firmware combination");
                return Err(UpdateError::MalformedSignedPayload { length: declared });
            }
            payload_len = Some(declared - sig_len as u64);
            signature = Some(self.read_signature(body, sig_len).await?);
        }

        let first = self.wait_for_data(body).await?.first().copied();
        let Some(first) = first else {
            return Err(UpdateError::InvalidResponse {
                length: plan.declared_len,
                content_type: None,
            });
        };

        let compressed = inflate::is_compressed(first, &plan.resource_url);
        if compressed && signature.is_some() {
            warn!(url = %plan.resource_url, "Compressed and signed image rejected");
            return Err(UpdateError::CompressedSignedUnsupported);
        }

        let expected = if compressed {
            None
        } else {
            Some(payload_len.ok_or(UpdateError::UnknownLength)?)
        };

        Ok(TransferSession {
            expected,
            compressed,
            compressed_len: if compressed { payload_len } else { None },
            signature,
        })
    }

    /// Stream one payload into the partition for `plan.target`.
    ///
    /// `on_phase` observes `Begun`, `Writing` and `Ended`. `Ended` is
    /// reported for failed writes too, once the partition is released.
    pub async fn run(
        &self,
        plan: &TransferPlan,
        body: &mut PayloadStream,
        flash: &mut dyn FlashPartitions,
        device: &mut dyn Device,
        progress: Option<ProgressCallback>,
        on_phase: &mut (dyn FnMut(UpdatePhase) + Send),
    ) -> Result<CommittedImage, UpdateError> {
        let session = self.prepare(plan, body).await?;
        info!(
            update_target = %plan.target,
            expected = ?session.expected,
            compressed = session.compressed,
            signed = session.signature.is_some(),
            "Starting transfer"
        );

        let mut writer = PartitionWriter::begin(flash, plan.target, session.expected)?;
        on_phase(UpdatePhase::Begun);
        if let Some(progress) = progress {
            writer.set_progress(progress);
        }
        on_phase(UpdatePhase::Writing);

        let streamed = if session.compressed {
            self.stream_compressed(&mut writer, body, device, session.compressed_len)
                .await
        } else {
            self.stream_raw(&mut writer, body, device).await
        };

        let written = writer.written();
        let ended = match streamed {
            Ok(()) => writer.end(),
            Err(e) => {
                writer.abort();
                Err(e)
            }
        };
        on_phase(UpdatePhase::Ended);
        let partition = ended?;

        info!(
            update_target = %plan.target,
            label = %partition.label,
            written,
            "Written successfully"
        );

        Ok(CommittedImage {
            target: plan.target,
            partition,
            len: written,
            compressed: session.compressed,
            signature: session.signature,
        })
    }

    /// Wait for the stream to offer data. An empty slice means end of stream.
    async fn wait_for_data<'b>(&self, body: &'b mut PayloadStream) -> Result<&'b [u8], UpdateError> {
        match tokio::time::timeout(self.stream_timeout, body.fill_buf()).await {
            Ok(Ok(buf)) => Ok(buf),
            Ok(Err(e)) => Err(UpdateError::NetworkError(e.to_string())),
            Err(_) => {
                let timeout_ms = self.stream_timeout.as_millis() as u64;
                warn!(timeout_ms, "Stream timed out waiting for data");
                Err(UpdateError::StreamTimeout { timeout_ms })
            }
        }
    }

    async fn read_signature(
        &self,
        body: &mut PayloadStream,
        len: usize,
    ) -> Result<Vec<u8>, UpdateError> {
        let mut signature = Vec::with_capacity(len);
        while signature.len() < len {
            let buf = self.wait_for_data(body).await?;
            if buf.is_empty() {
                return Err(UpdateError::MalformedSignedPayload {
                    length: signature.len() as u64,
                });
            }
            let n = buf.len().min(len - signature.len());
            signature.extend_from_slice(&buf[..n]);
            body.consume(n);
        }
        debug!(len, "Signature block extracted");
        Ok(signature)
    }

    async fn stream_raw(
        &self,
        writer: &mut PartitionWriter<'_>,
        body: &mut PayloadStream,
        device: &mut dyn Device,
    ) -> Result<(), UpdateError> {
        while let Some(remaining) = writer.remaining().filter(|&r| r > 0) {
            let buf = self.wait_for_data(body).await?;
            if buf.is_empty() {
                warn!(remaining, "Stream ended before the image was complete");
                break;
            }
            let n = remaining.min(buf.len() as u64) as usize;
            writer.write(&buf[..n])?;
            body.consume(n);

            device.feed_watchdog();
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn stream_compressed(
        &self,
        writer: &mut PartitionWriter<'_>,
        body: &mut PayloadStream,
        device: &mut dyn Device,
        compressed_len: Option<u64>,
    ) -> Result<(), UpdateError> {
        let mut inflator = Inflator::new();
        if !inflator.init() {
            return Err(InflateError::NotReady.into());
        }

        let result = self
            .inflate_stream(&mut inflator, writer, body, device, compressed_len)
            .await;

        let stats = inflator.stats();
        debug!(
            total_in = stats.total_in,
            total_out = stats.total_out,
            "Inflate finished"
        );
        inflator.end();
        result
    }

    async fn inflate_stream(
        &self,
        inflator: &mut Inflator,
        writer: &mut PartitionWriter<'_>,
        body: &mut PayloadStream,
        device: &mut dyn Device,
        compressed_len: Option<u64>,
    ) -> Result<(), UpdateError> {
        let sector = writer.sector_size();
        let mut consumed_in = 0u64;

        loop {
            let buf = self.wait_for_data(body).await?;
            let at_eof = buf.is_empty();

            let mut n = buf.len();
            if let Some(total) = compressed_len {
                if at_eof && consumed_in < total {
                    warn!(consumed_in, total, "Compressed stream ended early");
                    return Err(UpdateError::ShortWrite {
                        written: consumed_in,
                        expected: total,
                    });
                }
                n = n.min(total.saturating_sub(consumed_in) as usize);
            }
            let is_final = at_eof || compressed_len.is_some_and(|total| consumed_in + n as u64 >= total);

            let mut write_error = None;
            let status = inflator.inflate_block(
                &buf[..n],
                is_final,
                DICT_SIZE,
                |chunk| flash_chunk(writer, &chunk, sector, &mut write_error),
                || device.feed_watchdog(),
            );
            let status = match status {
                Ok(status) => status,
                Err(e) => return Err(write_error.unwrap_or(UpdateError::Inflate(e))),
            };

            body.consume(n);
            consumed_in += n as u64;

            match status {
                InflateStatus::StreamEnd => return Ok(()),
                InflateStatus::NeedsInput if is_final => {
                    return Err(InflateError::PrematureEnd.into());
                }
                InflateStatus::NeedsInput => {}
            }

            device.feed_watchdog();
            tokio::task::yield_now().await;
        }
    }
}

/// Write decoded bytes, keeping non-final writes sector aligned.
///
/// Returns the bytes taken; `0` signals a write failure, stored in `error`.
fn flash_chunk(
    writer: &mut PartitionWriter<'_>,
    chunk: &InflateChunk<'_>,
    sector: usize,
    error: &mut Option<UpdateError>,
) -> usize {
    let size = chunk.data.len();
    let len = if chunk.is_final || size <= sector {
        size
    } else {
        size - size % sector
    };

    match writer.write(&chunk.data[..len]) {
        Ok(written) => written,
        Err(e) => {
            warn!(index = chunk.index, len, error = %e, "Failed to flash inflated chunk");
            *error = Some(e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use crate::flash::MemoryFlash;
    use crate::transport::{MemoryResource, MemoryTransport, Transport};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    const URL: &str = "http://h/fw.bin";
    const ZZ_URL: &str = "http://h/fw.bin.zz";

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31) % 256) as u8).collect()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    struct Outcome {
        result: Result<CommittedImage, UpdateError>,
        phases: Vec<UpdatePhase>,
    }

    async fn transfer(
        engine: &TransferEngine,
        url: &str,
        resource: MemoryResource,
        flash: &mut MemoryFlash,
    ) -> Outcome {
        let transport = MemoryTransport::new().serve(url, resource);
        let response = transport.fetch(url, &[]).await.unwrap();
        let plan = match TransferPlan::from_response(UpdateTarget::Firmware, url, &response) {
            Ok(plan) => plan,
            Err(e) => {
                return Outcome {
                    result: Err(e),
                    phases: Vec::new(),
                }
            }
        };

        let mut body = response.body;
        let mut device = SimulatedDevice::default();
        let mut phases = Vec::new();
        let result = engine
            .run(&plan, &mut body, flash, &mut device, None, &mut |p: UpdatePhase| phases.push(p))
            .await;
        Outcome { result, phases }
    }

    #[tokio::test]
    async fn test_raw_transfer() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let data = image(20_000);

        let outcome = transfer(
            &TransferEngine::default(),
            URL,
            MemoryResource::ok(data.clone()).chunked(1500),
            &mut flash,
        )
        .await;

        let committed = outcome.result.unwrap();
        assert_eq!(committed.len, 20_000);
        assert!(!committed.compressed);
        assert_eq!(
            outcome.phases,
            vec![UpdatePhase::Begun, UpdatePhase::Writing, UpdatePhase::Ended]
        );
        assert_eq!(&flash.contents("ota_1").unwrap()[..20_000], &data[..]);
        assert_eq!(flash.boot_partition().unwrap().label, "ota_1");
    }

    #[tokio::test]
    async fn test_signature_block_is_split_off() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let signature = vec![0xA5u8; 128];
        let data = image(9000);
        let mut payload = signature.clone();
        payload.extend_from_slice(&data);

        let engine = TransferEngine::default().with_signature(128);
        let transport = MemoryTransport::new().serve(URL, MemoryResource::ok(payload).chunked(100));
        let mut response = transport.fetch(URL, &[]).await.unwrap();
        let plan = TransferPlan::from_response(UpdateTarget::Firmware, URL, &response).unwrap();

        let session = engine.prepare(&plan, &mut response.body).await.unwrap();
        assert_eq!(plan.declared_len, Some(9128));
        assert_eq!(session.expected, Some(9000));
        assert_eq!(session.signature.as_deref(), Some(&signature[..]));
        assert!(!session.compressed);
    }

    #[tokio::test]
    async fn test_signed_transfer_writes_image_only() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let data = image(5000);
        let mut payload = vec![0x11u8; 64];
        payload.extend_from_slice(&data);

        let outcome = transfer(
            &TransferEngine::default().with_signature(64),
            URL,
            MemoryResource::ok(payload),
            &mut flash,
        )
        .await;

        let committed = outcome.result.unwrap();
        assert_eq!(committed.len, 5000);
        assert_eq!(committed.signature, Some(vec![0x11u8; 64]));
        assert_eq!(&flash.contents("ota_1").unwrap()[..5000], &data[..]);
    }

    #[tokio::test]
    async fn test_short_write_rejected() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let mut resource = MemoryResource::ok(image(3000));
        resource.content_length = Some(5000);

        let outcome = transfer(&TransferEngine::default(), URL, resource, &mut flash).await;

        assert!(matches!(
            outcome.result,
            Err(UpdateError::ShortWrite {
                written: 3000,
                expected: 5000
            })
        ));
        assert_eq!(outcome.phases.last(), Some(&UpdatePhase::Ended));
        assert_eq!(flash.boot_partition().unwrap().label, "ota_0");
    }

    #[tokio::test]
    async fn test_compressed_transfer() {
        let mut flash = MemoryFlash::new(256 * 1024, 16 * 1024);
        let data = image(150_000);

        let outcome = transfer(
            &TransferEngine::default(),
            ZZ_URL,
            MemoryResource::ok(zlib(&data)).chunked(333),
            &mut flash,
        )
        .await;

        let committed = outcome.result.unwrap();
        assert!(committed.compressed);
        assert_eq!(committed.len, 150_000);
        assert_eq!(&flash.contents("ota_1").unwrap()[..150_000], &data[..]);
    }

    #[tokio::test]
    async fn test_compressed_chunked_response() {
        let mut flash = MemoryFlash::new(128 * 1024, 16 * 1024);
        let data = vec![0u8; 100_000];

        let outcome = transfer(
            &TransferEngine::default(),
            ZZ_URL,
            MemoryResource::ok(zlib(&data)).unknown_length(),
            &mut flash,
        )
        .await;

        assert_eq!(outcome.result.unwrap().len, 100_000);
    }

    #[tokio::test]
    async fn test_magic_without_hint_is_raw() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let compressed = zlib(&image(10_000));

        let outcome = transfer(
            &TransferEngine::default(),
            URL,
            MemoryResource::ok(compressed.clone()),
            &mut flash,
        )
        .await;

        let committed = outcome.result.unwrap();
        assert!(!committed.compressed);
        assert_eq!(committed.len, compressed.len() as u64);
    }

    #[tokio::test]
    async fn test_compressed_and_signed_rejected() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let mut payload = vec![0u8; 64];
        payload.extend_from_slice(&zlib(&image(10_000)));

        let outcome = transfer(
            &TransferEngine::default().with_signature(64),
            ZZ_URL,
            MemoryResource::ok(payload),
            &mut flash,
        )
        .await;

        assert!(matches!(
            outcome.result,
            Err(UpdateError::CompressedSignedUnsupported)
        ));
        assert!(outcome.phases.is_empty());
    }

    #[tokio::test]
    async fn test_signed_payload_too_short() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let outcome = transfer(
            &TransferEngine::default().with_signature(512),
            URL,
            MemoryResource::ok(vec![0u8; 512]),
            &mut flash,
        )
        .await;

        assert!(matches!(
            outcome.result,
            Err(UpdateError::MalformedSignedPayload { length: 512 })
        ));
    }

    #[tokio::test]
    async fn test_insufficient_space() {
        let mut flash = MemoryFlash::new(8 * 1024, 4 * 1024);
        let outcome = transfer(
            &TransferEngine::default(),
            URL,
            MemoryResource::ok(image(9000)),
            &mut flash,
        )
        .await;

        assert!(matches!(
            outcome.result,
            Err(UpdateError::InsufficientSpace {
                required: 9000,
                available: 8192,
                ..
            })
        ));
        assert!(outcome.phases.is_empty());
    }

    #[tokio::test]
    async fn test_raw_unknown_length_rejected() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let outcome = transfer(
            &TransferEngine::default(),
            URL,
            MemoryResource::ok(image(1000)).unknown_length(),
            &mut flash,
        )
        .await;

        assert!(matches!(outcome.result, Err(UpdateError::UnknownLength)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let outcome = transfer(
            &TransferEngine::new(Duration::from_millis(250)),
            URL,
            MemoryResource::ok(image(8000)).chunked(1000).stalling_after(3000),
            &mut flash,
        )
        .await;

        assert!(matches!(
            outcome.result,
            Err(UpdateError::StreamTimeout { timeout_ms: 250 })
        ));
        assert_eq!(flash.boot_partition().unwrap().label, "ota_0");
        assert!(flash.contents("ota_1").unwrap()[..3000].iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn test_response_validation() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let engine = TransferEngine::default();

        let outcome = transfer(&engine, URL, MemoryResource::status(404), &mut flash).await;
        assert!(matches!(
            outcome.result,
            Err(UpdateError::DownloadFailed { status: 404 })
        ));

        let outcome = transfer(
            &engine,
            URL,
            MemoryResource::with_type(image(10), "text/html"),
            &mut flash,
        )
        .await;
        assert!(matches!(outcome.result, Err(UpdateError::InvalidResponse { .. })));

        let outcome = transfer(&engine, URL, MemoryResource::ok(Vec::new()), &mut flash).await;
        assert!(matches!(outcome.result, Err(UpdateError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_gzip_type_without_zlib_stream_flashed_raw() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let data = image(5000);

        let outcome = transfer(
            &TransferEngine::default(),
            URL,
            MemoryResource::with_type(data.clone(), "application/gzip"),
            &mut flash,
        )
        .await;
        let committed = outcome.result.unwrap();
        assert!(!committed.compressed);
        assert_eq!(committed.len, 5000);
        assert_eq!(&flash.contents("ota_1").unwrap()[..5000], &data[..]);
        assert_eq!(flash.boot_partition().unwrap().label, "ota_1");
    }

    #[test]
    fn test_flash_chunk_alignment() {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let mut writer = PartitionWriter::begin(&mut flash, UpdateTarget::Firmware, None).unwrap();
        let data = vec![1u8; 10_000];
        let mut error = None;

        let chunk = InflateChunk {
            index: 0,
            data: &data,
            is_final: false,
        };
        assert_eq!(flash_chunk(&mut writer, &chunk, 4096, &mut error), 8192);

        let chunk = InflateChunk {
            index: 8192,
            data: &data[..1808],
            is_final: false,
        };
        assert_eq!(flash_chunk(&mut writer, &chunk, 4096, &mut error), 1808);

        let chunk = InflateChunk {
            index: 10_000,
            data: &data[..5000],
            is_final: true,
        };
        assert_eq!(flash_chunk(&mut writer, &chunk, 4096, &mut error), 5000);
        assert!(error.is_none());
    }
}
