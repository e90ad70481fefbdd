//! Streaming zlib inflator with a fixed 32 KiB ring dictionary.
//!
//! Decoded bytes land directly in the dictionary, which doubles as the
//! decoder's back-reference window. A consumer callback drains the ring:
//!
//! - whenever the ring is full (no more output can be produced)
//! - whenever at least `chunk_size` decoded bytes are pending
//! - on the final input block, until nothing is left
//!
//! The consumer may take fewer bytes than offered; the remainder stays in
//! place and is offered again on the next invocation. The write cursor only
//! wraps to the start of the ring once every byte up to the end has been
//! consumed, so the decoder's history is never disturbed.

use miniz_oxide::inflate::core::inflate_flags::{
    TINFL_FLAG_COMPUTE_ADLER32, TINFL_FLAG_HAS_MORE_INPUT, TINFL_FLAG_PARSE_ZLIB_HEADER,
};
use miniz_oxide::inflate::core::{decompress, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;
use thiserror::Error;
use tracing::{debug, warn};

/// Ring dictionary size, the standard deflate window.
pub const DICT_SIZE: usize = 32 * 1024;

/// First byte of every zlib stream this agent accepts.
pub const ZLIB_MAGIC: u8 = 0x78;

/// Inflation failures. Any of them aborts the whole transfer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InflateError {
    #[error("inflator not initialised")]
    NotReady,

    #[error("corrupted stream ({0})")]
    Corrupt(String),

    #[error("final input block ended before the stream did")]
    PrematureEnd,

    #[error("consumer took {consumed} of {offered} offered bytes")]
    Consumer { offered: usize, consumed: usize },
}

/// Outcome of one [`Inflator::inflate_block`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateStatus {
    /// Input exhausted, stream not finished yet
    NeedsInput,
    /// Stream complete and every decoded byte delivered
    StreamEnd,
}

/// Decoded bytes offered to the consumer.
#[derive(Debug)]
pub struct InflateChunk<'a> {
    /// Logical offset of `data[0]` in the decompressed output
    pub index: u64,
    pub data: &'a [u8],
    /// Last delivery of the stream
    pub is_final: bool,
}

/// Byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InflateStats {
    pub total_in: u64,
    pub total_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    NeedsInput,
    NeedsDrain,
    Done,
}

/// Incremental zlib decoder. Allocate with [`Inflator::init`], release with
/// [`Inflator::end`].
#[derive(Default)]
pub struct Inflator {
    dict: Option<Box<[u8]>>,
    decomp: Option<Box<DecompressorOxide>>,
    /// Start of decoded bytes not yet consumed
    dict_begin: usize,
    /// Decoder write position
    dict_offset: usize,
    total_in: u64,
    total_out: u64,
    finished: bool,
}

impl Inflator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the dictionary and decoder state.
    ///
    /// Returns `false` if the allocation fails; the inflator then stays not
    /// ready and must not be used.
    pub fn init(&mut self) -> bool {
        if self.dict.is_none() {
            let mut dict = Vec::new();
            if dict.try_reserve_exact(DICT_SIZE).is_err() {
                warn!(bytes = DICT_SIZE, "Unable to allocate inflate dictionary");
                return false;
            }
            dict.resize(DICT_SIZE, 0);
            self.dict = Some(dict.into_boxed_slice());
        }
        if self.decomp.is_none() {
            self.decomp = Some(Box::default());
        }
        self.reset();
        true
    }

    /// Restart decoding from a fresh zlib header, keeping allocations.
    pub fn reset(&mut self) {
        if let Some(decomp) = self.decomp.as_deref_mut() {
            decomp.init();
        }
        self.dict_begin = 0;
        self.dict_offset = 0;
        self.total_in = 0;
        self.total_out = 0;
        self.finished = false;
    }

    /// Release the dictionary and decoder state.
    pub fn end(&mut self) {
        debug!(total_in = self.total_in, total_out = self.total_out, "Inflator released");
        self.dict = None;
        self.decomp = None;
        self.reset();
    }

    pub fn is_ready(&self) -> bool {
        self.dict.is_some() && self.decomp.is_some()
    }

    pub fn stats(&self) -> InflateStats {
        InflateStats {
            total_in: self.total_in,
            total_out: self.total_out,
        }
    }

    /// Free space left for the decoder before the ring must be drained.
    pub fn dict_free(&self) -> usize {
        DICT_SIZE - self.dict_offset
    }

    /// Decoded bytes waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.dict_offset - self.dict_begin
    }

    /// Decode one input block, feeding decoded bytes to `consume`.
    ///
    /// `is_final` marks the last input block of the stream: every pending
    /// byte is then delivered, and a stream that is not complete by the end
    /// of the block is reported as [`InflateError::PrematureEnd`].
    /// `feed_watchdog` runs between decode rounds.
    pub fn inflate_block<C, W>(
        &mut self,
        input: &[u8],
        is_final: bool,
        chunk_size: usize,
        mut consume: C,
        mut feed_watchdog: W,
    ) -> Result<InflateStatus, InflateError>
    where
        C: FnMut(InflateChunk<'_>) -> usize,
        W: FnMut(),
    {
        if !self.is_ready() {
            return Err(InflateError::NotReady);
        }

        let chunk_size = chunk_size.clamp(1, DICT_SIZE);
        let mut input = input;

        loop {
            let round = self.round(&mut input, is_final)?;
            self.drain(is_final, chunk_size, &mut consume)?;

            match round {
                Round::Done => {
                    return Ok(if is_final {
                        InflateStatus::StreamEnd
                    } else {
                        InflateStatus::NeedsInput
                    });
                }
                Round::NeedsInput if input.is_empty() => return Ok(InflateStatus::NeedsInput),
                Round::NeedsInput | Round::NeedsDrain => feed_watchdog(),
            }
        }
    }

    /// Run the decoder once over `input`, advancing it past consumed bytes.
    fn round(&mut self, input: &mut &[u8], is_final: bool) -> Result<Round, InflateError> {
        if self.finished {
            // Trailing bytes after the zlib footer are ignored.
            *input = &[];
            return Ok(Round::Done);
        }
        if self.dict_free() == 0 {
            return Ok(Round::NeedsDrain);
        }

        let mut flags = TINFL_FLAG_PARSE_ZLIB_HEADER | TINFL_FLAG_COMPUTE_ADLER32;
        if !is_final {
            flags |= TINFL_FLAG_HAS_MORE_INPUT;
        }

        let (Some(decomp), Some(dict)) = (self.decomp.as_deref_mut(), self.dict.as_deref_mut())
        else {
            return Err(InflateError::NotReady);
        };

        let current: &[u8] = *input;
        let (status, read, written) = decompress(decomp, current, dict, self.dict_offset, flags);

        *input = &current[read..];
        self.total_in += read as u64;
        self.total_out += written as u64;
        self.dict_offset += written;

        match status {
            TINFLStatus::Done => {
                self.finished = true;
                Ok(Round::Done)
            }
            TINFLStatus::HasMoreOutput => Ok(Round::NeedsDrain),
            TINFLStatus::NeedsMoreInput | TINFLStatus::FailedCannotMakeProgress if is_final => {
                warn!(total_in = self.total_in, "Compressed stream truncated");
                Err(InflateError::PrematureEnd)
            }
            TINFLStatus::NeedsMoreInput => Ok(Round::NeedsInput),
            other => {
                warn!(status = ?other, total_in = self.total_in, "Inflate failure");
                Err(InflateError::Corrupt(format!("{:?}", other)))
            }
        }
    }

    /// Offer pending bytes to the consumer while the drain conditions hold.
    fn drain<C>(&mut self, is_final: bool, chunk_size: usize, consume: &mut C) -> Result<(), InflateError>
    where
        C: FnMut(InflateChunk<'_>) -> usize,
    {
        loop {
            let pending = self.pending();
            let full = self.dict_free() == 0;
            if !(full || (is_final && pending > 0) || pending >= chunk_size) {
                return Ok(());
            }

            let Some(dict) = self.dict.as_deref() else {
                return Err(InflateError::NotReady);
            };

            let consumed = consume(InflateChunk {
                index: self.total_out - pending as u64,
                data: &dict[self.dict_begin..self.dict_offset],
                is_final: is_final && self.finished,
            });

            if consumed == 0 || consumed > pending {
                warn!(offered = pending, consumed, "Inflate consumer violated its contract");
                return Err(InflateError::Consumer {
                    offered: pending,
                    consumed,
                });
            }

            self.dict_begin += consumed;
            if self.dict_begin == DICT_SIZE {
                // Ring fully drained at its end: wrap both cursors.
                self.dict_begin = 0;
                self.dict_offset = 0;
            }
        }
    }
}

/// Whether a payload should be treated as a zlib stream.
///
/// Both signals must agree: the first payload byte carries the zlib magic
/// and the resource path carries the `zz` hint.
pub fn is_compressed(first_byte: u8, resource_url: &str) -> bool {
    first_byte == ZLIB_MAGIC && resource_url.contains("zz")
}
