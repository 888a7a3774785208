//! Shared-filesystem frame cache.
//!
//! A write-through [`StorageProvider`] layered over any inner provider.
//! Reads try deterministic cache paths on the shared mount first and fall
//! back to the inner provider, publishing what they fetched asynchronously;
//! uploads are mirrored into the cache after the inner store succeeds. Cache
//! write failures are logged and swallowed; the cache is an accelerator,
//! never a source of truth.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<objectPath>/<chunkIndex:012>-<chunkSize>.bin   uncompressed chunk
//! <root>/<objectPath>/<cOffset:016x>C-<cSize>C.frm       compressed frame
//! <root>/<objectPath>/size.txt                           "<virtual> <raw>"
//! ```

pub mod lock;
pub mod publish;
pub(crate) mod writeback;

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{trace, warn};

use crate::block::align_down;
use crate::error::{Error, Result};
use crate::frame::{codec, FrameTable};
use crate::storage::{ObjectSize, StorageProvider, StoreOptions};
use crate::sync::cancel::CancelToken;

use lock::PathLock;
use publish::publish_bytes;
use writeback::WritebackPool;

/// Workers and queue depth for asynchronous cache publication.
const WRITEBACK_WORKERS: usize = 4;
const WRITEBACK_QUEUE: usize = 64;

pub struct NfsCache {
    root: PathBuf,
    inner: Arc<dyn StorageProvider>,
    chunk_size: u64,
    writeback: WritebackPool,
}

impl NfsCache {
    pub fn new(
        root: impl Into<PathBuf>,
        inner: Arc<dyn StorageProvider>,
        chunk_size: u64,
    ) -> Result<Self> {
        assert!(chunk_size > 0, "chunk size must be positive");
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(NfsCache {
            root,
            inner,
            chunk_size,
            writeback: WritebackPool::new(WRITEBACK_WORKERS, WRITEBACK_QUEUE),
        })
    }

    /// Waits for queued cache publications; used by tests and shutdown.
    pub fn flush(&self) {
        self.writeback.drain();
    }

    fn object_dir(&self, object: &str) -> PathBuf {
        self.root.join(object)
    }

    fn chunk_path(&self, object: &str, chunk_start: u64) -> PathBuf {
        self.object_dir(object).join(format!(
            "{:012}-{}.bin",
            chunk_start / self.chunk_size,
            self.chunk_size
        ))
    }

    fn frame_path(&self, object: &str, compressed_offset: u64, compressed_size: u32) -> PathBuf {
        frame_path_under(&self.object_dir(object), compressed_offset, compressed_size)
    }

    fn size_path(&self, object: &str) -> PathBuf {
        self.object_dir(object).join("size.txt")
    }

    // ── size.txt ──────────────────────────────────────────────────────────────

    fn read_cached_size(&self, object: &str) -> Option<ObjectSize> {
        let mut contents = String::new();
        File::open(self.size_path(object))
            .ok()?
            .read_to_string(&mut contents)
            .ok()?;
        let mut parts = contents.split_whitespace();
        let virtual_size = parts.next()?.parse().ok()?;
        let raw_size = parts.next()?.parse().ok()?;
        Some(ObjectSize {
            virtual_size,
            raw_size,
        })
    }

    // ── chunk reads (uncompressed objects) ────────────────────────────────────

    /// Reads `[within, within+buf.len())` of one cached chunk file. `None`
    /// when the file is absent; fewer bytes than requested means the object
    /// ends inside this chunk (published files are complete by construction).
    fn read_chunk_window(&self, path: &Path, within: u64, buf: &mut [u8]) -> Option<usize> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cache chunk {} unreadable: {e}", path.display());
                return None;
            }
        };
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], within + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("cache chunk {} read failed: {e}", path.display());
                    return None;
                }
            }
        }
        Some(filled)
    }

    /// Queues a background fetch-and-publish of one whole chunk.
    fn spawn_chunk_writeback(&self, object: &str, chunk_start: u64) {
        let inner = self.inner.clone();
        let path = self.chunk_path(object, chunk_start);
        let object = object.to_string();
        let chunk_size = self.chunk_size;
        self.writeback.submit(Box::new(move || {
            if path.exists() {
                return;
            }
            // The lock keeps concurrent processes from fetching the same
            // chunk; publication itself is atomic either way.
            let lock = match PathLock::acquire(&path) {
                Ok(lock) => lock,
                Err(Error::LockAlreadyHeld(_)) => return,
                Err(e) => {
                    warn!("chunk lock {} failed: {e}", path.display());
                    return;
                }
            };
            let token = CancelToken::never();
            let mut buf = vec![0u8; chunk_size as usize];
            match inner.get_frame(&object, chunk_start, None, false, &mut buf, &token) {
                Ok(n) if n > 0 => {
                    if let Err(e) = publish_bytes(&path, &buf[..n]) {
                        warn!("chunk publish {} failed: {e}", path.display());
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("chunk writeback fetch {object}@{chunk_start} failed: {e}"),
            }
            let _ = lock.release();
        }));
    }

    fn get_raw(
        &self,
        object: &str,
        offset: u64,
        buf: &mut [u8],
        token: &CancelToken,
    ) -> Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            token.check()?;
            let pos = offset + filled as u64;
            let chunk_start = align_down(pos, self.chunk_size);
            let within = pos - chunk_start;
            let want = ((self.chunk_size - within) as usize).min(buf.len() - filled);
            let path = self.chunk_path(object, chunk_start);

            match self.read_chunk_window(&path, within, &mut buf[filled..filled + want]) {
                Some(n) => {
                    trace!("cache hit {}", path.display());
                    filled += n;
                    if n < want {
                        break; // object ends inside this chunk
                    }
                }
                None => {
                    let n = self.inner.get_frame(
                        object,
                        pos,
                        None,
                        false,
                        &mut buf[filled..filled + want],
                        token,
                    )?;
                    self.spawn_chunk_writeback(object, chunk_start);
                    filled += n;
                    if n < want {
                        break;
                    }
                }
            }
        }
        Ok(filled)
    }

    // ── frame reads (compressed objects) ──────────────────────────────────────

    /// Cached compressed bytes for one frame, validated by length. A corrupt
    /// entry is removed and treated as a miss.
    fn read_cached_frame(&self, path: &Path, compressed_size: usize) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(compressed_size);
        match File::open(path) {
            Ok(mut f) => {
                if let Err(e) = f.read_to_end(&mut data) {
                    warn!("cached frame {} unreadable: {e}", path.display());
                    return None;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cached frame {} unreadable: {e}", path.display());
                return None;
            }
        }
        if data.len() != compressed_size {
            warn!(
                "cached frame {} has {} bytes, expected {compressed_size}; invalidating",
                path.display(),
                data.len()
            );
            let _ = fs::remove_file(path);
            return None;
        }
        Some(data)
    }

    fn get_framed(
        &self,
        object: &str,
        offset: u64,
        table: &FrameTable,
        decompress: bool,
        buf: &mut [u8],
        token: &CancelToken,
    ) -> Result<usize> {
        let loc = table.locate(offset)?;
        let c_len = loc.size.compressed as usize;
        let u_len = loc.size.uncompressed as usize;
        let path = self.frame_path(object, loc.compressed_offset, loc.size.compressed);

        let out_len = if decompress { u_len } else { c_len };
        if buf.len() < out_len {
            return Err(Error::BufferTooSmall {
                got: buf.len(),
                need: out_len,
            });
        }

        if let Some(compressed) = self.read_cached_frame(&path, c_len) {
            if decompress {
                match codec::decompress_frame_into(
                    table.compression(),
                    &compressed,
                    &mut buf[..u_len],
                ) {
                    Ok(()) => {
                        trace!("cache hit {}", path.display());
                        return Ok(u_len);
                    }
                    Err(e) => {
                        // Corrupt entry: invalidate and fall through to inner.
                        warn!("cached frame {} corrupt: {e}; invalidating", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            } else {
                buf[..c_len].copy_from_slice(&compressed);
                return Ok(c_len);
            }
        }

        // Miss: fetch the compressed form from the inner provider, persist it
        // asynchronously, serve the caller from memory.
        let mut compressed = vec![0u8; c_len];
        let n = self
            .inner
            .get_frame(object, offset, Some(table), false, &mut compressed, token)?;
        if n != c_len {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("inner returned {n} of {c_len} frame bytes"),
            )));
        }

        {
            let path = path.clone();
            let data = compressed.clone();
            self.writeback.submit(Box::new(move || {
                if let Err(e) = publish_bytes(&path, &data) {
                    warn!("frame publish {} failed: {e}", path.display());
                }
            }));
        }

        if decompress {
            codec::decompress_frame_into(table.compression(), &compressed, &mut buf[..u_len])?;
            Ok(u_len)
        } else {
            buf[..c_len].copy_from_slice(&compressed);
            Ok(c_len)
        }
    }

    // ── deletion ──────────────────────────────────────────────────────────────

    fn delete_cached_prefix(root: &Path, prefix: &str) {
        let mut dirs = Vec::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("cache sweep error under {}: {e}", root.display());
                    continue;
                }
            };
            let rel = match entry.path().strip_prefix(root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !rel.to_string_lossy().starts_with(prefix) {
                continue;
            }
            if entry.file_type().is_dir() {
                dirs.push(entry.path().to_path_buf());
            } else if let Err(e) = fs::remove_file(entry.path()) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("cache delete {} failed: {e}", entry.path().display());
                }
            }
        }
        for dir in dirs.iter().rev() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

impl StorageProvider for NfsCache {
    fn size(&self, object: &str, token: &CancelToken) -> Result<ObjectSize> {
        if let Some(size) = self.read_cached_size(object) {
            return Ok(size);
        }
        let size = self.inner.size(object, token)?;
        let path = self.size_path(object);
        self.writeback.submit(Box::new(move || {
            let contents = format!("{} {}", size.virtual_size, size.raw_size);
            if let Err(e) = publish_bytes(&path, contents.as_bytes()) {
                warn!("size publish {} failed: {e}", path.display());
            }
        }));
        Ok(size)
    }

    fn get_frame(
        &self,
        object: &str,
        offset: u64,
        frames: Option<&FrameTable>,
        decompress: bool,
        buf: &mut [u8],
        token: &CancelToken,
    ) -> Result<usize> {
        match frames {
            None => self.get_raw(object, offset, buf, token),
            Some(table) => self.get_framed(object, offset, table, decompress, buf, token),
        }
    }

    fn store_file(
        &self,
        src: &Path,
        object: &str,
        opts: &StoreOptions,
        token: &CancelToken,
    ) -> Result<Option<FrameTable>> {
        let table = self.inner.store_file(src, object, opts, token)?;

        match &table {
            None => {
                // Mirror the raw file into chunk files.
                let src = src.to_path_buf();
                let object = object.to_string();
                let chunk_size = self.chunk_size;
                let dir_marker = self.object_dir(&object).join("chunks");
                let me_root = self.root.clone();
                self.writeback.submit(Box::new(move || {
                    let lock = match PathLock::acquire(&dir_marker) {
                        Ok(lock) => lock,
                        Err(Error::LockAlreadyHeld(_)) => return,
                        Err(e) => {
                            warn!("store writeback lock failed: {e}");
                            return;
                        }
                    };
                    if let Err(e) =
                        mirror_chunks(&me_root, &src, &object, chunk_size, &lock)
                    {
                        warn!("store writeback of {object} failed: {e}");
                    }
                    let _ = lock.release();
                }));
            }
            Some(table) => {
                // Mirror each compressed frame as a .frm file, re-reading the
                // stored artifact through the inner provider.
                let inner = self.inner.clone();
                let object = object.to_string();
                let table = table.clone();
                let dir = self.object_dir(&object);
                let dir_marker = dir.join("frames");
                self.writeback.submit(Box::new(move || {
                    let lock = match PathLock::acquire(&dir_marker) {
                        Ok(lock) => lock,
                        Err(Error::LockAlreadyHeld(_)) => return,
                        Err(e) => {
                            warn!("store writeback lock failed: {e}");
                            return;
                        }
                    };
                    let token = CancelToken::never();
                    for fl in table.locations() {
                        let path =
                            frame_path_under(&dir, fl.compressed_offset, fl.size.compressed);
                        if path.exists() {
                            continue;
                        }
                        let mut compressed = vec![0u8; fl.size.compressed as usize];
                        match inner.get_frame(
                            &object,
                            fl.uncompressed_offset,
                            Some(&table),
                            false,
                            &mut compressed,
                            &token,
                        ) {
                            Ok(n) if n == compressed.len() => {
                                if let Err(e) = publish_bytes(&path, &compressed) {
                                    warn!("frame publish {} failed: {e}", path.display());
                                }
                            }
                            Ok(n) => warn!(
                                "frame {} writeback short read: {n} of {}",
                                fl.index,
                                compressed.len()
                            ),
                            Err(e) => warn!("frame {} writeback failed: {e}", fl.index),
                        }
                        if let Err(e) = lock.refresh() {
                            warn!("lock refresh failed: {e}");
                        }
                    }
                    let _ = lock.release();
                }));
            }
        }
        Ok(table)
    }

    fn delete_with_prefix(&self, prefix: &str, token: &CancelToken) -> Result<()> {
        // Inner deletion is synchronous; the cached tree goes asynchronously.
        self.inner.delete_with_prefix(prefix, token)?;
        let root = self.root.clone();
        let prefix = prefix.to_string();
        self.writeback.submit(Box::new(move || {
            Self::delete_cached_prefix(&root, &prefix);
        }));
        Ok(())
    }

    fn public_upload_url(&self, object: &str) -> Result<String> {
        self.inner.public_upload_url(object)
    }
}

fn frame_path_under(dir: &Path, compressed_offset: u64, compressed_size: u32) -> PathBuf {
    dir.join(format!("{compressed_offset:016x}C-{compressed_size}C.frm"))
}

/// Copies `src` into per-chunk cache files, refreshing `lock` between chunks.
fn mirror_chunks(
    root: &Path,
    src: &Path,
    object: &str,
    chunk_size: u64,
    lock: &PathLock,
) -> Result<()> {
    let file = File::open(src)?;
    let len = file.metadata()?.len();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut chunk_start = 0u64;
    while chunk_start < len {
        let want = (chunk_size.min(len - chunk_start)) as usize;
        let mut filled = 0usize;
        while filled < want {
            let n = file.read_at(&mut buf[filled..want], chunk_start + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let path = root.join(object).join(format!(
            "{:012}-{}.bin",
            chunk_start / chunk_size,
            chunk_size
        ));
        publish_bytes(&path, &buf[..filled])?;
        lock.refresh()?;
        chunk_start += chunk_size;
    }
    Ok(())
}
