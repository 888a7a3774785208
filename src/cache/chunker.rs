//! Remote-backed chunk fetcher.
//!
//! Reads against the base object are aligned up to [`CHUNK_SIZE`]. For each
//! missing chunk at most one fetch is in flight (singleflight keyed by chunk
//! index); concurrent fetches across chunks are bounded by a semaphore. A
//! failed fetch reaches every waiter of that chunk and releases the flight
//! slot, so the cache is never poisoned and the next caller simply refetches.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use log::{trace, warn};

use crate::block::{align_down, block_count, CHUNK_SIZE};
use crate::cache::mmap::MmapCache;
use crate::error::{Error, Result};
use crate::storage::ReaderAt;
use crate::sync::cancel::{CancelSource, CancelToken};
use crate::sync::semaphore::AdjustableSemaphore;
use crate::sync::singleflight::Singleflight;

pub struct Chunker {
    base: Arc<dyn ReaderAt>,
    cache: Arc<MmapCache>,
    flights: Singleflight<u64, ()>,
    fetch_slots: AdjustableSemaphore,
    prefetch_cancel: CancelSource,
    prefetch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Chunker {
    /// `concurrent_fetches` defaults to the CPU count.
    pub fn new(
        base: Arc<dyn ReaderAt>,
        cache: Arc<MmapCache>,
        concurrent_fetches: Option<u64>,
    ) -> Arc<Self> {
        let slots = concurrent_fetches.unwrap_or_else(|| num_cpus::get() as u64).max(1);
        Arc::new(Chunker {
            base,
            cache,
            flights: Singleflight::new(),
            fetch_slots: AdjustableSemaphore::new(slots),
            prefetch_cancel: CancelSource::new(),
            prefetch_handle: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &Arc<MmapCache> {
        &self.cache
    }

    /// Adjusts the fetch concurrency bound at runtime.
    pub fn set_concurrent_fetches(&self, n: u64) {
        self.fetch_slots.set_limit(n.max(1));
    }

    /// Blocks until every chunk touched by `[offset, offset+length)` is in
    /// the cache.
    fn ensure(&self, offset: u64, length: u64, token: &CancelToken) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let size = self.cache.size();
        let end = (offset + length).min(size);
        let mut chunk_start = align_down(offset.min(size), CHUNK_SIZE);
        while chunk_start < end {
            let chunk_len = CHUNK_SIZE.min(size - chunk_start);
            if !self.cache.is_cached(chunk_start, chunk_len) {
                let chunk_index = chunk_start / CHUNK_SIZE;
                self.flights.fly(chunk_index, token, || {
                    self.fetch_chunk(chunk_index, chunk_start, chunk_len, token)
                })?;
            }
            chunk_start += CHUNK_SIZE;
        }
        Ok(())
    }

    fn fetch_chunk(
        &self,
        chunk_index: u64,
        start: u64,
        len: u64,
        token: &CancelToken,
    ) -> Result<()> {
        self.fetch_slots.acquire(1, token)?;
        let result = self.fetch_chunk_inner(start, len, token);
        self.fetch_slots.release(1);
        match &result {
            Ok(()) => trace!("fetched chunk {chunk_index} ({len} bytes at {start})"),
            Err(e) => warn!("chunk {chunk_index} fetch failed: {e}"),
        }
        result
    }

    fn fetch_chunk_inner(&self, start: u64, len: u64, token: &CancelToken) -> Result<()> {
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            token.check()?;
            let n = self
                .base
                .read_at(&mut buf[filled..], start + filled as u64, token)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("base object ended {filled} bytes into chunk at {start}"),
                )));
            }
            filled += n;
        }
        self.cache.write_at(&buf, start)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset`, fetching missing chunks first.
    /// Never serves a chunk that has not fully landed.
    pub fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        self.ensure(offset, buf.len() as u64, token)?;
        self.cache.read_at(buf, offset)
    }

    /// Zero-copy view once the data is present.
    pub fn slice(&self, offset: u64, length: u64, token: &CancelToken) -> Result<&[u8]> {
        self.ensure(offset, length, token)?;
        self.cache.slice(offset, length)
    }

    /// Starts the background prefetch walking the file in chunk order. Fetch
    /// errors are logged and skipped; the walk stops on cancel or close.
    pub fn start_prefetch(self: &Arc<Self>) {
        let mut handle = self.prefetch_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let me = Arc::clone(self);
        let token = self.prefetch_cancel.token();
        *handle = Some(
            std::thread::Builder::new()
                .name("sediment-prefetch".into())
                .spawn(move || me.prefetch_walk(&token))
                .expect("spawn prefetch thread"),
        );
    }

    fn prefetch_walk(&self, token: &CancelToken) {
        let chunks = block_count(self.cache.size(), CHUNK_SIZE);
        for chunk in 0..chunks {
            if token.is_canceled() {
                trace!("prefetch canceled at chunk {chunk}");
                return;
            }
            let start = chunk * CHUNK_SIZE;
            let len = CHUNK_SIZE.min(self.cache.size() - start);
            if let Err(e) = self.ensure(start, len, token) {
                if matches!(e, Error::Canceled) {
                    return;
                }
                warn!("prefetch of chunk {chunk} failed: {e}");
            }
        }
        trace!("prefetch walked {chunks} chunks");
    }

    /// Stops the prefetch walk and waits for its thread.
    pub fn close(&self) {
        self.prefetch_cancel.cancel();
        if let Some(handle) = self.prefetch_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl ReaderAt for Chunker {
    fn read_at(&self, buf: &mut [u8], offset: u64, token: &CancelToken) -> Result<usize> {
        Chunker::read_at(self, buf, offset, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Base reader over an in-memory buffer, counting chunk reads.
    struct CountingBase {
        data: Vec<u8>,
        reads: AtomicU64,
        delay: Duration,
    }

    impl CountingBase {
        fn new(data: Vec<u8>, delay: Duration) -> Self {
            CountingBase {
                data,
                reads: AtomicU64::new(0),
                delay,
            }
        }
    }

    impl ReaderAt for CountingBase {
        fn read_at(&self, buf: &mut [u8], offset: u64, _token: &CancelToken) -> Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let offset = offset as usize;
            let n = buf.len().min(self.data.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }
    }

    fn setup(
        dir: &TempDir,
        size: u64,
        delay: Duration,
    ) -> (Arc<Chunker>, Arc<CountingBase>) {
        let data: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
        let base = Arc::new(CountingBase::new(data, delay));
        let cache = Arc::new(
            MmapCache::new(size, crate::block::ROOTFS_BLOCK_SIZE, &dir.path().join("c.bin"))
                .unwrap(),
        );
        let chunker = Chunker::new(base.clone() as Arc<dyn ReaderAt>, cache, Some(4));
        (chunker, base)
    }

    #[test]
    fn read_through_fetches_and_caches() {
        let dir = TempDir::new().unwrap();
        let (chunker, base) = setup(&dir, 2 * CHUNK_SIZE, Duration::ZERO);
        let token = CancelToken::never();

        let mut buf = vec![0u8; 4096];
        chunker.read_at(&mut buf, 0, &token).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 1);
        let after_first = base.reads.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        // Same chunk again: served from cache, no further base reads.
        chunker.read_at(&mut buf, 8192, &token).unwrap();
        assert_eq!(base.reads.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn concurrent_reads_of_one_chunk_fetch_once() {
        let dir = TempDir::new().unwrap();
        let (chunker, base) = setup(&dir, CHUNK_SIZE, Duration::from_millis(40));
        let token = CancelToken::never();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let chunker = chunker.clone();
                let token = token.clone();
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; 4096];
                    chunker.read_at(&mut buf, (i % 4) * 4096, &token).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // One chunk, one base fetch.
        assert_eq!(base.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_fetch_does_not_poison() {
        struct FlakyBase {
            attempts: AtomicU64,
        }
        impl ReaderAt for FlakyBase {
            fn read_at(
                &self,
                buf: &mut [u8],
                _offset: u64,
                _token: &CancelToken,
            ) -> Result<usize> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "transient",
                    )));
                }
                buf.fill(0x42);
                Ok(buf.len())
            }
        }

        let dir = TempDir::new().unwrap();
        let base = Arc::new(FlakyBase {
            attempts: AtomicU64::new(0),
        });
        let cache = Arc::new(
            MmapCache::new(CHUNK_SIZE, 4096, &dir.path().join("c.bin")).unwrap(),
        );
        let chunker = Chunker::new(base, cache, None);
        let token = CancelToken::never();

        let mut buf = vec![0u8; 4096];
        assert!(chunker.read_at(&mut buf, 0, &token).is_err());
        // Retry succeeds: the failed flight released its slot.
        chunker.read_at(&mut buf, 0, &token).unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn slice_returns_view_after_fetch() {
        let dir = TempDir::new().unwrap();
        let (chunker, _) = setup(&dir, CHUNK_SIZE, Duration::ZERO);
        let view = chunker.slice(100, 50, &CancelToken::never()).unwrap();
        assert_eq!(view.len(), 50);
        assert_eq!(view[0], (100 % 241) as u8);
    }

    #[test]
    fn prefetch_walks_whole_file() {
        let dir = TempDir::new().unwrap();
        let (chunker, _) = setup(&dir, 3 * CHUNK_SIZE, Duration::ZERO);
        chunker.start_prefetch();
        // The walk is asynchronous; poll until it lands.
        for _ in 0..500 {
            if chunker.cache().is_cached(0, 3 * CHUNK_SIZE) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(chunker.cache().is_cached(0, 3 * CHUNK_SIZE));
        chunker.close();
    }

    #[test]
    fn canceled_read_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let (chunker, _) = setup(&dir, CHUNK_SIZE, Duration::ZERO);
        let src = CancelSource::new();
        src.cancel();
        let mut buf = vec![0u8; 4096];
        let err = chunker.read_at(&mut buf, 0, &src.token()).unwrap_err();
        assert!(matches!(err, Error::Canceled | Error::Shared(_)));
    }
}
