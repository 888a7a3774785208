//! Lazy-fetch storage: the read-only device exposed to the hypervisor's
//! userfault handler.
//!
//! Composes a provider-backed reader, the mmap block cache, and the chunker:
//! page faults translate into block-aligned reads here, missing chunks are
//! fetched (and deduplicated) by the chunker, and repeat faults are served
//! from the local cache.

use std::sync::Arc;

use crate::block::CHUNK_SIZE;
use crate::cache::chunker::Chunker;
use crate::cache::mmap::MmapCache;
use crate::error::{Error, Result};
use crate::frame::FrameTable;
use crate::storage::{Device, ReaderAt, StorageProvider};
use crate::sync::cancel::CancelToken;

/// [`ReaderAt`] over a provider object, decoding frames when the object is
/// stored compressed.
pub struct ProviderReader {
    provider: Arc<dyn StorageProvider>,
    object: String,
    frames: Option<Arc<FrameTable>>,
}

impl ProviderReader {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        object: impl Into<String>,
        frames: Option<Arc<FrameTable>>,
    ) -> Self {
        ProviderReader {
            provider,
            object: object.into(),
            frames,
        }
    }
}

impl ReaderAt for ProviderReader {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        let table = match &self.frames {
            None => {
                return self
                    .provider
                    .get_frame(&self.object, offset, None, false, buf, token)
            }
            Some(table) => table,
        };

        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let loc = match table.frame_containing(pos) {
                Ok(loc) => loc,
                // Past the last frame: report what we have.
                Err(Error::NoFrameAtOffset(_)) if filled > 0 => break,
                Err(e) => return Err(e),
            };
            let u_len = loc.size.uncompressed as usize;

            if loc.uncompressed_offset == pos && buf.len() - filled >= u_len {
                // Frame-aligned with room: decode straight into the caller's
                // buffer.
                let n = self.provider.get_frame(
                    &self.object,
                    loc.uncompressed_offset,
                    Some(table),
                    true,
                    &mut buf[filled..filled + u_len],
                    token,
                )?;
                filled += n;
            } else {
                let mut frame = vec![0u8; u_len];
                self.provider.get_frame(
                    &self.object,
                    loc.uncompressed_offset,
                    Some(table),
                    true,
                    &mut frame,
                    token,
                )?;
                let start = (pos - loc.uncompressed_offset) as usize;
                let n = (u_len - start).min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&frame[start..start + n]);
                filled += n;
            }
        }
        Ok(filled)
    }
}

/// Read-only block device fetched lazily from a [`StorageProvider`].
pub struct LazyStorage {
    chunker: Arc<Chunker>,
    block_size: u64,
}

impl LazyStorage {
    /// `cache_path` receives the sparse local cache file; it is deleted on
    /// close. With `prefetch` the whole object is walked in the background.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        object: &str,
        size: u64,
        block_size: u64,
        cache_path: &std::path::Path,
        frames: Option<Arc<FrameTable>>,
        concurrent_fetches: Option<u64>,
        prefetch: bool,
    ) -> Result<Self> {
        let cache = Arc::new(MmapCache::new(size, block_size, cache_path)?);
        let reader = Arc::new(ProviderReader::new(provider, object, frames));
        let chunker = Chunker::new(reader, cache, concurrent_fetches);
        if prefetch {
            chunker.start_prefetch();
        }
        Ok(LazyStorage {
            chunker,
            block_size,
        })
    }

    pub fn chunker(&self) -> &Arc<Chunker> {
        &self.chunker
    }
}

impl Device for LazyStorage {
    /// Reads must be block-aligned and at least one block; buffers larger
    /// than a chunk are the caller's responsibility to split.
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        if (buf.len() as u64) < self.block_size {
            return Err(Error::BufferTooSmall {
                got: buf.len(),
                need: self.block_size as usize,
            });
        }
        if buf.len() as u64 > CHUNK_SIZE {
            return Err(Error::BufferTooLarge {
                got: buf.len(),
                max: CHUNK_SIZE as usize,
            });
        }
        if offset % self.block_size != 0 {
            return Err(Error::OffsetUnaligned {
                offset,
                block_size: self.block_size,
            });
        }
        self.chunker.read_at(buf, offset, token)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.chunker.cache().size()
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn slice(&self, offset: u64, length: u64, token: &CancelToken) -> Result<&[u8]> {
        self.chunker.slice(offset, length, token)
    }

    fn close(&self) -> Result<()> {
        self.chunker.close();
        self.chunker.cache().close()
    }
}
