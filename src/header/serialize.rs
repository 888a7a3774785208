//! Versioned little-endian header format.
//!
//! A single metadata block precedes the map records; there is no padding
//! between fields or records.
//!
//! ```text
//! Metadata (64 bytes):
//!   version              u64
//!   generation           u64
//!   block_size           u64
//!   size                 u64
//!   build_id             u128
//!   base_build_id        u128
//!
//! Record, version <= 3 (40 bytes):
//!   offset               u64
//!   length               u64
//!   build_id             u128
//!   build_storage_offset u64
//!
//! Record, version 4:
//!   ... as above, then
//!   packed               u64   (compression << 24) | num_frames
//!   when compression != None:
//!     frame_offset_u     u64
//!     frame_offset_c     u64
//!     num_frames × { size_u u32, size_c u32 }
//! ```
//!
//! Version-3 consumers drop version-4 frame information; re-serializing a
//! v4 header at v3 is the supported downgrade path.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{CompressionType, FrameSize, FrameTable};
use crate::header::{BuildMap, Metadata};

/// Versions this build understands.
const MIN_VERSION: u64 = 1;
const MAX_VERSION: u64 = 4;

const PACKED_FRAME_MASK: u64 = (1 << 24) - 1;

// ─────────────────────────────────────────────────────────────────────────────
// Bounds-checked little-endian cursor
// ─────────────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::TruncatedHeader(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_uuid(&mut self) -> Result<Uuid> {
        let raw = u128::from_le_bytes(self.take(16)?.try_into().unwrap());
        Ok(Uuid::from_u128_le(raw))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_uuid(out: &mut Vec<u8>, v: &Uuid) {
    out.extend_from_slice(&v.to_u128_le().to_le_bytes());
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialize
// ─────────────────────────────────────────────────────────────────────────────

pub fn serialize(metadata: &Metadata, maps: &[BuildMap]) -> Result<Vec<u8>> {
    let version = metadata.version;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(Error::UnsupportedVersion(version));
    }
    if metadata.block_size == 0 {
        return Err(Error::ZeroBlockSize);
    }

    let mut out = Vec::with_capacity(64 + maps.len() * 48);
    write_u64(&mut out, metadata.version);
    write_u64(&mut out, metadata.generation);
    write_u64(&mut out, metadata.block_size);
    write_u64(&mut out, metadata.size);
    write_uuid(&mut out, &metadata.build_id);
    write_uuid(&mut out, &metadata.base_build_id);

    for map in maps {
        write_u64(&mut out, map.offset);
        write_u64(&mut out, map.length);
        write_uuid(&mut out, &map.build_id);
        write_u64(&mut out, map.build_storage_offset);

        if version < 4 {
            continue;
        }

        // A frame table with `None` compression carries no decode information
        // and is dropped, same as the v3 downgrade.
        match map.frames.as_deref() {
            Some(table) if table.compression() != CompressionType::None => {
                let num = table.frame_count() as u64;
                assert!(num <= PACKED_FRAME_MASK, "frame count exceeds packed field");
                let packed = ((table.compression().code() as u64) << 24) | num;
                write_u64(&mut out, packed);
                write_u64(&mut out, table.start_uncompressed());
                write_u64(&mut out, table.start_compressed());
                for f in table.frames() {
                    write_u32(&mut out, f.uncompressed);
                    write_u32(&mut out, f.compressed);
                }
            }
            _ => {
                write_u64(&mut out, 0);
            }
        }
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Deserialize
// ─────────────────────────────────────────────────────────────────────────────

pub fn deserialize(bytes: &[u8]) -> Result<(Metadata, Vec<BuildMap>)> {
    let mut r = Reader::new(bytes);

    let version = r.read_u64()?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(Error::UnsupportedVersion(version));
    }
    let generation = r.read_u64()?;
    let block_size = r.read_u64()?;
    if block_size == 0 {
        return Err(Error::ZeroBlockSize);
    }
    let size = r.read_u64()?;
    let build_id = r.read_uuid()?;
    let base_build_id = r.read_uuid()?;
    let metadata = Metadata {
        version,
        generation,
        block_size,
        size,
        build_id,
        base_build_id,
    };

    let mut maps = Vec::new();
    while !r.is_empty() {
        let offset = r.read_u64()?;
        let length = r.read_u64()?;
        let map_build_id = r.read_uuid()?;
        let build_storage_offset = r.read_u64()?;

        let frames = if version >= 4 {
            let packed = r.read_u64()?;
            let compression = CompressionType::from_code((packed >> 24) as u8)?;
            let num = (packed & PACKED_FRAME_MASK) as usize;
            if compression == CompressionType::None {
                None
            } else {
                let start_uncompressed = r.read_u64()?;
                let start_compressed = r.read_u64()?;
                let mut frames = Vec::with_capacity(num);
                for _ in 0..num {
                    frames.push(FrameSize {
                        uncompressed: r.read_u32()?,
                        compressed: r.read_u32()?,
                    });
                }
                Some(Arc::new(FrameTable::new(
                    compression,
                    start_uncompressed,
                    start_compressed,
                    frames,
                )))
            }
        } else {
            None
        };

        maps.push(BuildMap {
            offset,
            length,
            build_id: map_build_id,
            build_storage_offset,
            frames,
        });
    }
    Ok((metadata, maps))
}
