//! Layered block map: how a build's logical address space is assembled from
//! chunks of prior builds plus a fresh diff.
//!
//! A [`Header`] is [`Metadata`] plus an ordered list of [`BuildMap`]s that
//! partition the logical space. The header owns its mapping; frame tables
//! hanging off individual maps are immutable and reference-shared.

pub mod mapping;
pub mod serialize;

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::block::block_index;
use crate::error::{Error, Result};
use crate::frame::FrameTable;
use crate::marker::BlockSet;

pub use mapping::{
    create_mapping, merge_mappings, normalize_mappings, validate_mappings, BuildMap,
};

/// 128-bit opaque build identifier.
pub type BuildId = Uuid;

/// The "ignore / zero-fill" build id.
pub const NIL_BUILD_ID: BuildId = Uuid::nil();

/// Current on-disk header version.
pub const CURRENT_VERSION: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub version: u64,
    pub generation: u64,
    pub block_size: u64,
    pub size: u64,
    pub build_id: BuildId,
    pub base_build_id: BuildId,
}

impl Metadata {
    /// Metadata for a fresh build with no ancestor.
    pub fn new_build(build_id: BuildId, size: u64, block_size: u64) -> Self {
        Metadata {
            version: CURRENT_VERSION,
            generation: 0,
            block_size,
            size,
            build_id,
            base_build_id: build_id,
        }
    }

    /// Metadata for the next build derived from this one. The serialization
    /// version is carried forward unchanged.
    pub fn next_generation(&self, build_id: BuildId) -> Metadata {
        Metadata {
            version: self.version,
            generation: self.generation + 1,
            block_size: self.block_size,
            size: self.size,
            build_id,
            base_build_id: self.build_id,
        }
    }
}

/// Storage location resolved for a logical offset.
#[derive(Debug, Clone)]
pub struct ShiftedMapping {
    /// Offset inside the owning build's storage.
    pub storage_offset: u64,
    /// Bytes remaining in the owning map past the queried offset.
    pub length: u64,
    pub build_id: BuildId,
    pub frames: Option<Arc<FrameTable>>,
}

pub struct Header {
    metadata: Metadata,
    mapping: Vec<BuildMap>,
    /// One bit per block at which a map starts.
    starts: BlockSet,
    /// Start block → index into `mapping`.
    by_start_block: HashMap<u64, usize>,
}

impl Header {
    /// Validates `mapping` against `metadata` and builds the offset index.
    pub fn new(metadata: Metadata, mapping: Vec<BuildMap>) -> Result<Self> {
        if metadata.block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }
        validate_mappings(&mapping, metadata.size, metadata.block_size)?;

        let blocks = crate::block::block_count(metadata.size, metadata.block_size);
        let mut starts = BlockSet::new(blocks.max(1));
        let mut by_start_block = HashMap::with_capacity(mapping.len());
        for (idx, map) in mapping.iter().enumerate() {
            let start_block = block_index(map.offset, metadata.block_size);
            starts.set(start_block);
            by_start_block.insert(start_block, idx);
        }

        Ok(Header {
            metadata,
            mapping,
            starts,
            by_start_block,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn mapping(&self) -> &[BuildMap] {
        &self.mapping
    }

    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    pub fn block_size(&self) -> u64 {
        self.metadata.block_size
    }

    /// Resolves `offset` to its owning map via a predecessor query on the
    /// start-block bitset, shifted to the position inside that map.
    pub fn get_shifted_mapping(&self, offset: u64) -> Result<ShiftedMapping> {
        if offset >= self.metadata.size {
            return Err(Error::NoMappingAtOffset(offset));
        }
        let block = block_index(offset, self.metadata.block_size);
        let start_block = self
            .starts
            .prev_set(block)
            .ok_or(Error::NoMappingAtOffset(offset))?;
        let idx = self.by_start_block[&start_block];
        let map = &self.mapping[idx];
        let shift = offset - map.offset;
        Ok(ShiftedMapping {
            storage_offset: map.build_storage_offset + shift,
            length: map.length - shift,
            build_id: map.build_id,
            frames: map.frames.clone(),
        })
    }

    /// Attaches frame subsets to every map owned by this header's build;
    /// maps attributed to ancestor builds are untouched.
    pub fn add_frames(&mut self, table: &FrameTable) -> Result<()> {
        for map in &mut self.mapping {
            if map.build_id != self.metadata.build_id {
                continue;
            }
            let subset = table.subset(map.build_storage_offset, map.length)?;
            map.frames = Some(Arc::new(subset));
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize::serialize(&self.metadata, &self.mapping)
    }

    /// Reads a header, validating the mapping. A record-less header gets a
    /// single full-range map owned by the header's build.
    pub fn deserialize(bytes: &[u8]) -> Result<Header> {
        let (metadata, mut mapping) = serialize::deserialize(bytes)?;
        if mapping.is_empty() {
            mapping.push(BuildMap {
                offset: 0,
                length: metadata.size,
                build_id: metadata.build_id,
                build_storage_offset: 0,
                frames: None,
            });
        }
        Header::new(metadata, mapping)
    }
}
