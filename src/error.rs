//! Crate-wide error type.
//!
//! Every boundary error from the storage engine is a variant here so callers
//! can pattern-match without downcasting. Transient I/O arrives through the
//! `Io` variant; errors shared between concurrent waiters (singleflight,
//! transition handles) are wrapped in `Shared` so one failure can be observed
//! by many callers without cloning the underlying `io::Error`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::sandbox::SandboxState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A read touched a block that has not been fetched into the cache yet.
    #[error("bytes not available")]
    BytesNotAvailable,

    /// The caller's buffer is smaller than the minimum the device accepts.
    #[error("buffer too small: got {got} bytes, need at least {need}")]
    BufferTooSmall { got: usize, need: usize },

    /// The caller's buffer exceeds what a single operation may cover.
    #[error("buffer too large: got {got} bytes, at most {max} allowed")]
    BufferTooLarge { got: usize, max: usize },

    /// Offset is not a multiple of the device block size.
    #[error("offset {offset} not aligned to block size {block_size}")]
    OffsetUnaligned { offset: u64, block_size: u64 },

    /// Write attempted on a read-only device.
    #[error("device is read-only")]
    ReadOnly,

    #[error("sandbox {0} already exists")]
    AlreadyExists(String),

    #[error("sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: String },

    #[error("lock already held: {0}")]
    LockAlreadyHeld(PathBuf),

    /// Second `set_*` on a one-shot cell.
    #[error("already set")]
    AlreadySet,

    #[error("pool closed")]
    PoolClosed,

    #[error("operation canceled")]
    Canceled,

    #[error("invalid sandbox state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },

    // ── Header / mapping validation ──────────────────────────────────────────
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u64),

    #[error("header block size must not be zero")]
    ZeroBlockSize,

    #[error("header truncated at byte {0}")]
    TruncatedHeader(usize),

    #[error("mapping at offset {offset} not contiguous, expected offset {expected}")]
    MappingDiscontiguous { offset: u64, expected: u64 },

    #[error("mapping length {length} not a multiple of block size {block_size}")]
    MappingUnaligned { length: u64, block_size: u64 },

    #[error("mappings cover {covered} bytes, expected {expected}")]
    MappingCoverage { covered: u64, expected: u64 },

    #[error("no mapping contains offset {0}")]
    NoMappingAtOffset(u64),

    // ── Frames / compression ─────────────────────────────────────────────────
    #[error("unknown compression code {0}")]
    UnknownCompression(u8),

    #[error("range [{start}, +{length}) does not land on frame boundaries")]
    FrameMisaligned { start: u64, length: u64 },

    #[error("no frame starts at uncompressed offset {0}")]
    NoFrameAtOffset(u64),

    /// A cached frame failed length or decompression validation.
    #[error("corrupt cached frame at {path}: {reason}")]
    CorruptFrame { path: PathBuf, reason: String },

    #[error("diff block size {0} unsupported (hugepage or rootfs block only)")]
    UnsupportedBlockSize(u64),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// An error produced once and observed by multiple waiters.
    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

impl Error {
    /// Wraps this error for distribution to multiple waiters.
    pub fn into_shared(self) -> Arc<Error> {
        match self {
            Error::Shared(arc) => arc,
            other => Arc::new(other),
        }
    }

    /// True when the error is the cache-miss signal used by the overlay and
    /// chunker read paths.
    pub fn is_bytes_not_available(&self) -> bool {
        matches!(self, Error::BytesNotAvailable)
    }
}
