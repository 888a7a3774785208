//! Mmap-backed block cache.
//!
//! A fixed-size sparse file, opened once and mapped shared for reads; writes
//! go through `pwrite` on the same descriptor and land in the same page
//! cache, so the mapping observes them without remapping. Presence is
//! tracked per block in an atomic [`Marker`]: `write_at` publishes blocks
//! with a release store, readers gate on an acquire load, so any reader that
//! sees a block marked also sees its bytes.
//!
//! Writes at a given block must happen at most once or be serialized by the
//! caller; concurrent reads of present blocks are safe.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::trace;
use memmap2::{Mmap, MmapOptions};
use nix::sys::uio::pwrite;

use crate::block::{block_count, blocks_in_range};
use crate::error::{Error, Result};
use crate::marker::{BlockSet, Marker};
use crate::storage::{Device, Slicer};
use crate::sync::cancel::CancelToken;

pub struct MmapCache {
    file: File,
    map: Mmap,
    marker: Marker,
    size: u64,
    block_size: u64,
    path: PathBuf,
    closed: AtomicBool,
}

impl MmapCache {
    /// Creates (or truncates) the backing file at `path`, sized to `size`,
    /// and maps it.
    pub fn new(size: u64, block_size: u64, path: &Path) -> Result<Self> {
        assert!(size > 0, "cache size must be positive");
        assert!(block_size > 0, "cache block size must be positive");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;

        // Without sparse-file support the holes must be materialized so the
        // mapping has real pages to fault in.
        #[cfg(not(has_sparse_files))]
        {
            use std::io::Write;
            let mut f = &file;
            let zeros = vec![0u8; 1 << 20];
            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(zeros.len() as u64) as usize;
                f.write_all(&zeros[..n])?;
                remaining -= n as u64;
            }
        }

        // SAFETY: the mapping is over a file this process just created and
        // keeps open for its own lifetime. Contents change only through
        // `write_at` below, and readers are gated behind the presence marker
        // (release on mark, acquire on check).
        let map = unsafe { MmapOptions::new().len(size as usize).map(&file)? };

        Ok(MmapCache {
            file,
            map,
            marker: Marker::new(block_count(size, block_size)),
            size,
            block_size,
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset > self.size || len as u64 > self.size - offset {
            return Err(Error::BufferTooLarge {
                got: len,
                max: self.size.saturating_sub(offset) as usize,
            });
        }
        Ok(())
    }

    /// True when every block touched by `[offset, offset+length)` is present.
    pub fn is_cached(&self, offset: u64, length: u64) -> bool {
        blocks_in_range(offset, length, self.block_size).all(|b| self.marker.is_marked(b))
    }

    /// Copies cached bytes into `buf`. Fails with
    /// [`Error::BytesNotAvailable`] when any touched block is absent.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let view = self.slice(offset, buf.len() as u64)?;
        buf.copy_from_slice(view);
        Ok(buf.len())
    }

    /// Writes `buf` through the descriptor and marks every touched block
    /// present.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_range(offset, buf.len())?;
        let mut written = 0usize;
        while written < buf.len() {
            match pwrite(
                self.file.as_fd(),
                &buf[written..],
                (offset as i64) + written as i64,
            ) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "pwrite returned zero",
                    )))
                }
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::Io(std::io::Error::from(e))),
            }
        }
        for block in blocks_in_range(offset, buf.len() as u64, self.block_size) {
            self.marker.mark(block);
        }
        trace!(
            "cache write {} bytes at {offset} ({})",
            buf.len(),
            self.path.display()
        );
        Ok(buf.len())
    }

    /// Zero-copy view of the mapping; same availability rule as `read_at`.
    pub fn slice(&self, offset: u64, length: u64) -> Result<&[u8]> {
        self.check_range(offset, length as usize)?;
        if !self.is_cached(offset, length) {
            return Err(Error::BytesNotAvailable);
        }
        Ok(&self.map[offset as usize..(offset + length) as usize])
    }

    /// Point-in-time copy of the presence bits.
    pub fn cached_blocks(&self) -> BlockSet {
        self.marker.snapshot()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Unmaps and deletes the backing file. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for MmapCache {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Slicer for MmapCache {
    fn slice(&self, offset: u64, length: u64) -> Result<&[u8]> {
        MmapCache::slice(self, offset, length)
    }
}

impl Device for MmapCache {
    fn read_at(&self, buf: &mut [u8], offset: u64, _token: &CancelToken) -> Result<usize> {
        MmapCache::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        MmapCache::write_at(self, buf, offset)
    }

    fn sync(&self) -> Result<()> {
        MmapCache::sync(self)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn slice(&self, offset: u64, length: u64, _token: &CancelToken) -> Result<&[u8]> {
        MmapCache::slice(self, offset, length)
    }

    fn close(&self) -> Result<()> {
        MmapCache::close(self)
    }
}
