//! Copy-on-write overlay.
//!
//! Wraps a read-only base device with a writable mmap cache. Reads prefer
//! the cache and fault missing blocks in from the base; writes land only in
//! the cache and are recorded in a dirty marker, the input to the diff
//! builder once the sandbox pauses.

use std::sync::Arc;

use log::trace;

use crate::block::blocks_in_range;
use crate::cache::mmap::MmapCache;
use crate::error::{Error, Result};
use crate::marker::{BlockSet, Marker};
use crate::storage::{Device, ReaderAt};
use crate::sync::cancel::CancelToken;

pub struct Overlay {
    base: Arc<dyn Device>,
    cache: MmapCache,
    dirty: Marker,
}

impl Overlay {
    /// `cache` must match the base's size and block size; the overlay takes
    /// exclusive ownership of it (and of its backing file).
    pub fn new(base: Arc<dyn Device>, cache: MmapCache) -> Self {
        assert_eq!(base.size(), cache.size(), "overlay cache size mismatch");
        assert_eq!(
            base.block_size(),
            cache.block_size(),
            "overlay block size mismatch"
        );
        let blocks = crate::block::block_count(cache.size(), cache.block_size());
        Overlay {
            base,
            cache,
            dirty: Marker::new(blocks),
        }
    }

    fn block_size(&self) -> u64 {
        self.cache.block_size()
    }

    /// Faults one block in from the base device if it is not yet cached.
    fn ensure_block(&self, block: u64, token: &CancelToken) -> Result<()> {
        let bs = self.block_size();
        let start = block * bs;
        let len = bs.min(self.cache.size() - start);
        if self.cache.is_cached(start, len) {
            return Ok(());
        }
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self
                .base
                .read_at(&mut buf[filled..], start + filled as u64, token)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "base device ended inside a block",
                )));
            }
            filled += n;
        }
        self.cache.write_at(&buf, start)?;
        trace!("overlay faulted block {block} from base");
        Ok(())
    }

    /// Reads preferring the cache; a miss falls through to the base per
    /// block, so blocks already written in the cache are never clobbered by
    /// stale base data.
    pub fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        match self.cache.read_at(buf, offset) {
            Err(Error::BytesNotAvailable) => {
                for block in blocks_in_range(offset, buf.len() as u64, self.block_size()) {
                    self.ensure_block(block, token)?;
                }
                self.cache.read_at(buf, offset)
            }
            other => other,
        }
    }

    /// Writes to the cache only, marking the touched blocks dirty. A write
    /// that covers a block only partially faults the rest of that block in
    /// first so the cache never holds a half-valid block.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let bs = self.block_size();
        let end = offset + buf.len() as u64;
        let token = CancelToken::never();
        for block in blocks_in_range(offset, buf.len() as u64, bs) {
            let block_start = block * bs;
            let block_end = (block_start + bs).min(self.cache.size());
            let fully_covered = offset <= block_start && end >= block_end;
            if !fully_covered {
                self.ensure_block(block, &token)?;
            }
        }
        let n = self.cache.write_at(buf, offset)?;
        for block in blocks_in_range(offset, buf.len() as u64, bs) {
            self.dirty.mark(block);
        }
        Ok(n)
    }

    /// Zero-copy view, faulting missing blocks in first.
    pub fn slice(&self, offset: u64, length: u64, token: &CancelToken) -> Result<&[u8]> {
        match self.cache.slice(offset, length) {
            Err(Error::BytesNotAvailable) => {
                for block in blocks_in_range(offset, length, self.block_size()) {
                    self.ensure_block(block, token)?;
                }
                self.cache.slice(offset, length)
            }
            other => other,
        }
    }

    /// Blocks written since creation.
    pub fn dirty(&self) -> &Marker {
        &self.dirty
    }

    /// Snapshot of the dirty blocks, the input to the diff builder.
    pub fn dirty_blocks(&self) -> BlockSet {
        self.dirty.snapshot()
    }

    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    pub fn size(&self) -> u64 {
        self.cache.size()
    }

    /// Closes the overlay cache (deleting its backing file); the base device
    /// is left open for its other users.
    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}

impl ReaderAt for Overlay {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        Overlay::read_at(self, buf, offset, token)
    }
}

impl Device for Overlay {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        Overlay::read_at(self, buf, offset, token)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Overlay::write_at(self, buf, offset)
    }

    fn sync(&self) -> Result<()> {
        Overlay::sync(self)
    }

    fn size(&self) -> u64 {
        Overlay::size(self)
    }

    fn block_size(&self) -> u64 {
        self.cache.block_size()
    }

    fn slice(&self, offset: u64, length: u64, token: &CancelToken) -> Result<&[u8]> {
        Overlay::slice(self, offset, length, token)
    }

    fn close(&self) -> Result<()> {
        Overlay::close(self)
    }
}
