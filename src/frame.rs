//! Per-frame compression index.
//!
//! A frame is the smallest unit of compressed data that decodes
//! independently. A [`FrameTable`] maps a contiguous range of a build's
//! storage between its uncompressed and compressed dimensions: a starting
//! (uncompressed, compressed) offset pair plus the size pair of every frame,
//! contiguous in both dimensions.
//!
//! Tables are immutable once built and shared via `Arc` among block maps
//! split from the same source; deriving a narrower view goes through
//! [`FrameTable::subset`], never mutation.

pub mod codec;

use crate::error::{Error, Result};

/// Compression algorithm of a framed artifact. The discriminant is the wire
/// code stored in version-4 headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
    Lz4 = 2,
}

impl CompressionType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            2 => Ok(CompressionType::Lz4),
            other => Err(Error::UnknownCompression(other)),
        }
    }
}

/// Uncompressed and compressed byte length of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub uncompressed: u32,
    pub compressed: u32,
}

/// Where a frame lives in both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub index: usize,
    pub uncompressed_offset: u64,
    pub compressed_offset: u64,
    pub size: FrameSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTable {
    compression: CompressionType,
    start_uncompressed: u64,
    start_compressed: u64,
    frames: Vec<FrameSize>,
}

impl FrameTable {
    pub fn new(
        compression: CompressionType,
        start_uncompressed: u64,
        start_compressed: u64,
        frames: Vec<FrameSize>,
    ) -> Self {
        FrameTable {
            compression,
            start_uncompressed,
            start_compressed,
            frames,
        }
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn start_uncompressed(&self) -> u64 {
        self.start_uncompressed
    }

    pub fn start_compressed(&self) -> u64 {
        self.start_compressed
    }

    pub fn frames(&self) -> &[FrameSize] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn uncompressed_len(&self) -> u64 {
        self.frames.iter().map(|f| f.uncompressed as u64).sum()
    }

    pub fn compressed_len(&self) -> u64 {
        self.frames.iter().map(|f| f.compressed as u64).sum()
    }

    pub fn end_uncompressed(&self) -> u64 {
        self.start_uncompressed + self.uncompressed_len()
    }

    pub fn end_compressed(&self) -> u64 {
        self.start_compressed + self.compressed_len()
    }

    /// Walks frames in order with their absolute offsets in both dimensions.
    pub fn locations(&self) -> impl Iterator<Item = FrameLocation> + '_ {
        let mut u = self.start_uncompressed;
        let mut c = self.start_compressed;
        self.frames.iter().enumerate().map(move |(index, &size)| {
            let loc = FrameLocation {
                index,
                uncompressed_offset: u,
                compressed_offset: c,
                size,
            };
            u += size.uncompressed as u64;
            c += size.compressed as u64;
            loc
        })
    }

    /// The frame starting exactly at uncompressed offset `offset`.
    pub fn locate(&self, offset: u64) -> Result<FrameLocation> {
        for loc in self.locations() {
            if loc.uncompressed_offset == offset {
                return Ok(loc);
            }
            if loc.uncompressed_offset > offset {
                break;
            }
        }
        Err(Error::NoFrameAtOffset(offset))
    }

    /// The frame whose uncompressed span contains `offset`.
    pub fn frame_containing(&self, offset: u64) -> Result<FrameLocation> {
        for loc in self.locations() {
            let end = loc.uncompressed_offset + loc.size.uncompressed as u64;
            if loc.uncompressed_offset <= offset && offset < end {
                return Ok(loc);
            }
        }
        Err(Error::NoFrameAtOffset(offset))
    }

    /// A new table whose frames exactly cover `[start, start+length)` in the
    /// uncompressed dimension, with the (U, C) starts shifted to match.
    /// Fails when either boundary does not land on a frame boundary.
    pub fn subset(&self, start: u64, length: u64) -> Result<FrameTable> {
        let end = start + length;
        let misaligned = || Error::FrameMisaligned { start, length };

        if start < self.start_uncompressed || end > self.end_uncompressed() {
            return Err(misaligned());
        }

        let mut frames = Vec::new();
        let mut start_compressed = None;
        for loc in self.locations() {
            if loc.uncompressed_offset < start {
                continue;
            }
            if start_compressed.is_none() {
                if loc.uncompressed_offset != start {
                    return Err(misaligned());
                }
                start_compressed = Some(loc.compressed_offset);
            }
            if loc.uncompressed_offset >= end {
                break;
            }
            let frame_end = loc.uncompressed_offset + loc.size.uncompressed as u64;
            if frame_end > end {
                return Err(misaligned());
            }
            frames.push(loc.size);
        }

        let start_compressed = start_compressed.ok_or_else(misaligned)?;
        let table = FrameTable {
            compression: self.compression,
            start_uncompressed: start,
            start_compressed,
            frames,
        };
        if table.uncompressed_len() != length {
            return Err(misaligned());
        }
        Ok(table)
    }

    /// Joins `other` onto the end of `self`: frames past `self`'s
    /// uncompressed end are appended; duplicates at the boundary are dropped.
    /// Fails unless `other` begins at or before that end and the tables use
    /// the same compression.
    pub fn extend(&self, other: &FrameTable) -> Result<FrameTable> {
        if self.compression != other.compression {
            return Err(Error::FrameMisaligned {
                start: other.start_uncompressed,
                length: other.uncompressed_len(),
            });
        }
        let boundary = self.end_uncompressed();
        if other.start_uncompressed > boundary {
            return Err(Error::FrameMisaligned {
                start: other.start_uncompressed,
                length: other.uncompressed_len(),
            });
        }
        let mut frames = self.frames.clone();
        for loc in other.locations() {
            if loc.uncompressed_offset < boundary {
                continue;
            }
            frames.push(loc.size);
        }
        Ok(FrameTable {
            compression: self.compression,
            start_uncompressed: self.start_uncompressed,
            start_compressed: self.start_compressed,
            frames,
        })
    }
}
