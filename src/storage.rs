//! Storage traits and backends.
//!
//! [`Device`] is the block-device surface served to the VM runtime;
//! [`StorageProvider`] is the object-store capability set the engine consumes
//! ({object-store, local-filesystem, cache-wrapped}; the NFS cache is itself
//! a provider wrapping another). One process-wide provider instance is
//! expected; everything takes it behind an `Arc`.

pub mod lazy;
pub mod local;

use std::path::Path;

use crate::error::Result;
use crate::frame::{CompressionType, FrameTable};
use crate::sync::cancel::CancelToken;

/// Positioned reads with cancellation. Implementations read as many bytes as
/// the buffer holds unless the end of the object truncates the read.
pub trait ReaderAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize>;
}

/// Zero-copy byte views. The borrow is tied to the backing store; callers
/// must observe the store's availability rules.
pub trait Slicer: Send + Sync {
    fn slice(&self, offset: u64, length: u64) -> Result<&[u8]>;
}

/// The storage device API consumed by the VM runtime.
pub trait Device: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn sync(&self) -> Result<()>;
    fn size(&self) -> u64;
    fn block_size(&self) -> u64;
    fn slice(&self, offset: u64, length: u64, token: &CancelToken) -> Result<&[u8]>;
    fn close(&self) -> Result<()>;
}

/// Virtual (uncompressed) and raw (as-stored) byte size of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSize {
    pub virtual_size: u64,
    pub raw_size: u64,
}

/// Upload options for [`StorageProvider::store_file`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub compression: CompressionType,
    /// Uncompressed bytes per frame when compressing.
    pub frame_size: u64,
    /// Codec level; ignored for `CompressionType::None`.
    pub level: i32,
}

impl StoreOptions {
    pub fn uncompressed() -> Self {
        StoreOptions {
            compression: CompressionType::None,
            frame_size: crate::block::CHUNK_SIZE,
            level: 0,
        }
    }

    pub fn zstd(frame_size: u64) -> Self {
        StoreOptions {
            compression: CompressionType::Zstd,
            frame_size,
            level: crate::frame::codec::DEFAULT_ZSTD_LEVEL,
        }
    }
}

/// Object-store capability set.
pub trait StorageProvider: Send + Sync {
    /// Virtual and raw size of `object`.
    fn size(&self, object: &str, token: &CancelToken) -> Result<ObjectSize>;

    /// Reads framed data.
    ///
    /// Without a frame table this is a raw read of `buf.len()` bytes at
    /// `offset` in the stored object. With a table, `offset` names the
    /// uncompressed start of one frame; the frame is returned decompressed
    /// (`decompress = true`, `buf` holding the uncompressed bytes) or as its
    /// stored compressed form. Returns the byte count written to `buf`.
    fn get_frame(
        &self,
        object: &str,
        offset: u64,
        frames: Option<&FrameTable>,
        decompress: bool,
        buf: &mut [u8],
        token: &CancelToken,
    ) -> Result<usize>;

    /// Uploads `src` as `object`. With compression enabled the artifact is
    /// framed and the emitted table returned.
    fn store_file(
        &self,
        src: &Path,
        object: &str,
        opts: &StoreOptions,
        token: &CancelToken,
    ) -> Result<Option<FrameTable>>;

    /// Deletes every object whose path starts with `prefix`.
    fn delete_with_prefix(&self, prefix: &str, token: &CancelToken) -> Result<()>;

    /// A URL a client can upload `object` through directly.
    fn public_upload_url(&self, object: &str) -> Result<String>;
}
