//! Frame compression codecs.
//!
//! Each frame compresses independently so a reader can decode any frame with
//! only the frame table in hand. Zstd frames are standard zstd streams; LZ4
//! frames are raw blocks (size carried by the table, not the payload).

use crate::error::{Error, Result};
use crate::frame::{CompressionType, FrameSize, FrameTable};

/// A compressed build artifact plus the table describing it.
#[derive(Debug)]
pub struct CompressedArtifact {
    pub data: Vec<u8>,
    pub table: FrameTable,
}

/// Default zstd level used by the uploader.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compresses `input` into independent frames of at most `frame_size`
/// uncompressed bytes and emits the matching table (starting at (0, 0)).
pub fn compress_frames(
    input: &[u8],
    compression: CompressionType,
    frame_size: usize,
    level: i32,
) -> Result<CompressedArtifact> {
    assert!(frame_size > 0, "frame size must be positive");

    let mut data = Vec::new();
    let mut frames = Vec::with_capacity(input.len().div_ceil(frame_size.max(1)));

    for window in input.chunks(frame_size) {
        let compressed = compress_one(window, compression, level)?;
        frames.push(FrameSize {
            uncompressed: window.len() as u32,
            compressed: compressed.len() as u32,
        });
        data.extend_from_slice(&compressed);
    }

    Ok(CompressedArtifact {
        data,
        table: FrameTable::new(compression, 0, 0, frames),
    })
}

fn compress_one(window: &[u8], compression: CompressionType, level: i32) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(window.to_vec()),
        CompressionType::Zstd => Ok(zstd::bulk::compress(window, level)?),
        CompressionType::Lz4 => Ok(lz4::block::compress(window, None, false)?),
    }
}

/// Decompresses one frame into a fresh buffer of exactly `uncompressed_len`
/// bytes.
pub fn decompress_frame(
    compression: CompressionType,
    src: &[u8],
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match compression {
        CompressionType::None => src.to_vec(),
        CompressionType::Zstd => zstd::bulk::decompress(src, uncompressed_len)?,
        CompressionType::Lz4 => lz4::block::decompress(src, Some(uncompressed_len as i32))?,
    };
    if out.len() != uncompressed_len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "frame decoded to {} bytes, expected {uncompressed_len}",
                out.len()
            ),
        )));
    }
    Ok(out)
}

/// Decompresses one frame into `dst`, which must be exactly the frame's
/// uncompressed length.
pub fn decompress_frame_into(
    compression: CompressionType,
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    let out = decompress_frame(compression, src, dst.len())?;
    dst.copy_from_slice(&out);
    Ok(())
}
