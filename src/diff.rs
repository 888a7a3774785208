//! Page-granularity diff builder.
//!
//! After a sandbox pauses, the big-page dirty set from the overlay names the
//! hugepages the guest touched. Touched pages often contain long runs that
//! match the original memfile byte for byte, so each big page is re-read from
//! the live source and compared window by window against the original: only
//! windows that actually differ make it into the diff, and differing windows
//! that are all zero become zero-fill markers instead of stored bytes.

use std::io::Write;

use rayon::prelude::*;

use crate::block::{block_count, HUGEPAGE_SIZE, ROOTFS_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::header::{create_mapping, BuildId, BuildMap, NIL_BUILD_ID};
use crate::marker::BlockSet;
use crate::storage::{ReaderAt, Slicer};
use crate::sync::cancel::CancelToken;

/// Outcome of the diff pass: which small pages changed, which changed to
/// all-zero, and the window size both sets are counted in.
#[derive(Debug)]
pub struct DiffMetadata {
    pub dirty: BlockSet,
    pub empty: BlockSet,
    pub block_size: u64,
}

impl DiffMetadata {
    /// Builds the diff's mapping contribution: dirty windows attributed to
    /// `build_id` with dense storage offsets (matching the diff stream
    /// layout), empty windows attributed to the zero-fill build.
    pub fn build_maps(&self, build_id: BuildId) -> Vec<BuildMap> {
        let dirty = create_mapping(build_id, &self.dirty, self.block_size);
        let mut empty = create_mapping(NIL_BUILD_ID, &self.empty, self.block_size);
        for m in &mut empty {
            m.build_storage_offset = 0;
        }

        // Disjoint sorted lists; merge by offset.
        let mut out = Vec::with_capacity(dirty.len() + empty.len());
        let (mut di, mut ei) = (dirty.into_iter().peekable(), empty.into_iter().peekable());
        loop {
            match (di.peek(), ei.peek()) {
                (Some(d), Some(e)) => {
                    if d.offset < e.offset {
                        out.push(di.next().unwrap());
                    } else {
                        out.push(ei.next().unwrap());
                    }
                }
                (Some(_), None) => out.push(di.next().unwrap()),
                (None, Some(_)) => out.push(ei.next().unwrap()),
                (None, None) => break,
            }
        }
        out
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WindowClass {
    Unchanged,
    Zero,
    Dirty,
}

fn classify(live: &[u8], original: &[u8]) -> WindowClass {
    if live == original {
        return WindowClass::Unchanged;
    }
    if is_all_zero(live) {
        return WindowClass::Zero;
    }
    WindowClass::Dirty
}

/// Word-wise zero scan.
fn is_all_zero(buf: &[u8]) -> bool {
    let mut chunks = buf.chunks_exact(8);
    if !chunks.all(|c| u64::from_ne_bytes(c.try_into().unwrap()) == 0) {
        return false;
    }
    buf.chunks_exact(8).remainder().iter().all(|&b| b == 0)
}

/// Walks every set big page, compares `block_size` windows of the live
/// source against the original, appends differing non-zero windows to `out`
/// in ascending offset order, and returns the dirty/empty sets.
///
/// `block_size` must be the hugepage or rootfs block size.
pub fn build_diff(
    source: &dyn ReaderAt,
    original: &dyn Slicer,
    big_dirty: &BlockSet,
    size: u64,
    block_size: u64,
    out: &mut dyn Write,
    token: &CancelToken,
) -> Result<DiffMetadata> {
    if block_size != HUGEPAGE_SIZE && block_size != ROOTFS_BLOCK_SIZE {
        return Err(Error::UnsupportedBlockSize(block_size));
    }

    let windows_total = block_count(size, block_size);
    let mut dirty = BlockSet::new(windows_total.max(1));
    let mut empty = BlockSet::new(windows_total.max(1));

    let mut page_buf = vec![0u8; HUGEPAGE_SIZE as usize];
    for page in big_dirty.iter_set() {
        token.check()?;
        let page_off = page * HUGEPAGE_SIZE;
        if page_off >= size {
            break;
        }
        let page_len = HUGEPAGE_SIZE.min(size - page_off) as usize;
        let live = &mut page_buf[..page_len];

        let mut filled = 0usize;
        while filled < live.len() {
            let n = source.read_at(&mut live[filled..], page_off + filled as u64, token)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "live source ended inside a dirty page",
                )));
            }
            filled += n;
        }

        let orig = original.slice(page_off, page_len as u64)?;

        let classes: Vec<WindowClass> = live
            .par_chunks(block_size as usize)
            .zip(orig.par_chunks(block_size as usize))
            .map(|(l, o)| classify(l, o))
            .collect();

        for (w, class) in classes.iter().enumerate() {
            let window_index = (page_off / block_size) + w as u64;
            let window_start = w * block_size as usize;
            match class {
                WindowClass::Unchanged => {}
                WindowClass::Zero => empty.set(window_index),
                WindowClass::Dirty => {
                    dirty.set(window_index);
                    let window_end = (window_start + block_size as usize).min(page_len);
                    out.write_all(&live[window_start..window_end])?;
                }
            }
        }
    }

    Ok(DiffMetadata {
        dirty,
        empty,
        block_size,
    })
}
