//! Build map construction, merging, and normalization.
//!
//! A [`BuildMap`] attributes one contiguous slice of the logical address
//! space to one build. The operations here keep two invariants: maps are
//! sorted by offset with no gaps, and every length is a multiple of the block
//! size. `merge_mappings` layers a diff over a base; `normalize_mappings`
//! coalesces adjacent maps of the same build.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frame::FrameTable;
use crate::header::{BuildId, NIL_BUILD_ID};
use crate::marker::BlockSet;

#[derive(Debug, Clone, PartialEq)]
pub struct BuildMap {
    /// Start in the logical address space.
    pub offset: u64,
    /// Byte length; a multiple of the block size.
    pub length: u64,
    /// Which build holds this range. [`NIL_BUILD_ID`] means zero-fill.
    pub build_id: BuildId,
    /// Where the bytes live inside that build's storage.
    pub build_storage_offset: u64,
    /// Compression index covering exactly this map's storage range.
    pub frames: Option<Arc<FrameTable>>,
}

impl BuildMap {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The surviving piece `[new_offset, new_end)` of this map after a merge
    /// split. Shifts the storage offset and narrows the frame table to the
    /// shifted storage range.
    fn trimmed(&self, new_offset: u64, new_end: u64) -> Result<BuildMap> {
        debug_assert!(new_offset >= self.offset && new_end <= self.end());
        let shift = new_offset - self.offset;
        let length = new_end - new_offset;
        let build_storage_offset = self.build_storage_offset + shift;
        let frames = match &self.frames {
            None => None,
            Some(table) if shift == 0 && length == self.length => Some(table.clone()),
            Some(table) => Some(Arc::new(table.subset(build_storage_offset, length)?)),
        };
        Ok(BuildMap {
            offset: new_offset,
            length,
            build_id: self.build_id,
            build_storage_offset,
            frames,
        })
    }
}

/// Coalesces runs of set bits into maps attributed to `build_id`, with
/// sequential storage offsets so the diff storage is dense.
pub fn create_mapping(build_id: BuildId, dirty: &BlockSet, block_size: u64) -> Vec<BuildMap> {
    let mut out = Vec::new();
    let mut storage = 0u64;
    let mut run: Option<(u64, u64)> = None; // (first block, block count)

    let mut flush = |run: (u64, u64), storage: &mut u64, out: &mut Vec<BuildMap>| {
        let (first, count) = run;
        let length = count * block_size;
        out.push(BuildMap {
            offset: first * block_size,
            length,
            build_id,
            build_storage_offset: *storage,
            frames: None,
        });
        *storage += length;
    };

    for idx in dirty.iter_set() {
        run = match run {
            Some((first, count)) if idx == first + count => Some((first, count + 1)),
            Some(prev) => {
                flush(prev, &mut storage, &mut out);
                Some((idx, 1))
            }
            None => Some((idx, 1)),
        };
    }
    if let Some(last) = run {
        flush(last, &mut storage, &mut out);
    }
    out
}

/// Layers `diff` over `base`. `base` must be sorted, contiguous, and cover
/// the full logical size; `diff` must be sorted and non-overlapping. Base
/// maps split by a diff carry frame subsets for their shifted storage ranges.
pub fn merge_mappings(base: &[BuildMap], diff: &[BuildMap]) -> Result<Vec<BuildMap>> {
    let mut out = Vec::with_capacity(base.len() + 2 * diff.len());
    let mut base_iter = base.iter();
    let mut cur: Option<BuildMap> = base_iter.next().cloned();

    for d in diff {
        let d_end = d.end();

        // Base maps entirely before the diff pass through.
        while matches!(cur, Some(ref b) if b.end() <= d.offset) {
            out.push(cur.take().unwrap());
            cur = base_iter.next().cloned();
        }

        // A base map straddling the diff start leaves a left survivor.
        if let Some(ref b) = cur {
            if b.offset < d.offset && b.end() > d.offset {
                out.push(b.trimmed(b.offset, d.offset)?);
            }
        }

        // Base maps wholly covered by the diff are dropped; a straddler at
        // the diff end survives on the right.
        loop {
            match cur {
                Some(ref b) if b.end() <= d_end => {
                    cur = base_iter.next().cloned();
                }
                Some(ref b) if b.offset < d_end => {
                    cur = Some(b.trimmed(d_end, b.end())?);
                    break;
                }
                _ => break,
            }
        }

        out.push(d.clone());
    }

    if let Some(b) = cur {
        out.push(b);
    }
    out.extend(base_iter.cloned());
    Ok(out)
}

/// Joins adjacent maps with the same build id. Never mutates the input.
///
/// Two maps join only when they are logically adjacent and (for real builds)
/// their storage is adjacent too. Frame tables join by appending the frames
/// past the first table's uncompressed end; a table-presence mismatch or a
/// non-joinable table pair keeps the maps separate.
pub fn normalize_mappings(maps: &[BuildMap]) -> Vec<BuildMap> {
    let mut out: Vec<BuildMap> = Vec::with_capacity(maps.len());
    for m in maps {
        if let Some(last) = out.last_mut() {
            let adjacent = last.build_id == m.build_id
                && last.end() == m.offset
                && (m.build_id == NIL_BUILD_ID
                    || last.build_storage_offset + last.length == m.build_storage_offset);
            if adjacent {
                let joined_frames = match (&last.frames, &m.frames) {
                    (None, None) => Some(None),
                    (Some(a), Some(b)) => a.extend(b).ok().map(|t| Some(Arc::new(t))),
                    _ => None,
                };
                if let Some(frames) = joined_frames {
                    last.length += m.length;
                    last.frames = frames;
                    continue;
                }
            }
        }
        out.push(m.clone());
    }
    out
}

/// Checks contiguity, block alignment, and full coverage of `size`.
pub fn validate_mappings(maps: &[BuildMap], size: u64, block_size: u64) -> Result<()> {
    if block_size == 0 {
        return Err(Error::ZeroBlockSize);
    }
    let mut expected = 0u64;
    for m in maps {
        if m.offset != expected {
            return Err(Error::MappingDiscontiguous {
                offset: m.offset,
                expected,
            });
        }
        if m.length % block_size != 0 {
            return Err(Error::MappingUnaligned {
                length: m.length,
                block_size,
            });
        }
        expected += m.length;
    }
    if expected != size {
        return Err(Error::MappingCoverage {
            covered: expected,
            expected: size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CompressionType, FrameSize};
    use uuid::Uuid;

    const B: u64 = 4096;

    fn map(offset: u64, length: u64, build_id: BuildId, storage: u64) -> BuildMap {
        BuildMap {
            offset,
            length,
            build_id,
            build_storage_offset: storage,
            frames: None,
        }
    }

    #[test]
    fn create_mapping_coalesces_runs() {
        let id = Uuid::new_v4();
        let mut dirty = BlockSet::new(32);
        for idx in [1u64, 2, 3, 7, 10, 11] {
            dirty.set(idx);
        }
        let maps = create_mapping(id, &dirty, B);
        assert_eq!(maps.len(), 3);
        assert_eq!((maps[0].offset, maps[0].length), (B, 3 * B));
        assert_eq!((maps[1].offset, maps[1].length), (7 * B, B));
        assert_eq!((maps[2].offset, maps[2].length), (10 * B, 2 * B));
        // Storage is dense.
        assert_eq!(maps[0].build_storage_offset, 0);
        assert_eq!(maps[1].build_storage_offset, 3 * B);
        assert_eq!(maps[2].build_storage_offset, 4 * B);
    }

    #[test]
    fn create_mapping_empty_set() {
        assert!(create_mapping(Uuid::new_v4(), &BlockSet::new(16), B).is_empty());
    }

    #[test]
    fn merge_diff_fully_inside_base() {
        let z = Uuid::new_v4();
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        let base = vec![
            map(0, 2 * B, z, 0),
            map(2 * B, 4 * B, a, 0),
            map(6 * B, 2 * B, z, 2 * B),
        ];
        let diff = vec![map(3 * B, B, d, 0)];

        let merged = merge_mappings(&base, &diff).unwrap();
        let got: Vec<(u64, u64, BuildId)> =
            merged.iter().map(|m| (m.offset, m.length, m.build_id)).collect();
        assert_eq!(
            got,
            vec![
                (0, 2 * B, z),
                (2 * B, B, a),
                (3 * B, B, d),
                (4 * B, 2 * B, a),
                (6 * B, 2 * B, z),
            ]
        );
        // The right survivor's storage is shifted past the split point.
        assert_eq!(merged[3].build_storage_offset, 2 * B);
        validate_mappings(&merged, 8 * B, B).unwrap();
    }

    #[test]
    fn merge_identity() {
        let a = Uuid::new_v4();
        let base = vec![map(0, 4 * B, a, 0), map(4 * B, 4 * B, a, 4 * B)];
        let merged = merge_mappings(&base, &[]).unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn merge_base_fully_inside_diff() {
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        let base = vec![map(0, B, a, 0), map(B, B, a, B), map(2 * B, 2 * B, a, 2 * B)];
        let diff = vec![map(0, 2 * B, d, 0)];
        let merged = merge_mappings(&base, &diff).unwrap();
        let got: Vec<(u64, u64, BuildId)> =
            merged.iter().map(|m| (m.offset, m.length, m.build_id)).collect();
        assert_eq!(got, vec![(0, 2 * B, d), (2 * B, 2 * B, a)]);
    }

    #[test]
    fn merge_diff_overlapping_base_right() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let d = Uuid::new_v4();
        let base = vec![map(0, 4 * B, a, 0), map(4 * B, 4 * B, b, 0)];
        // Diff covers the right half of `a` and the left half of `b`.
        let diff = vec![map(2 * B, 4 * B, d, 0)];
        let merged = merge_mappings(&base, &diff).unwrap();
        let got: Vec<(u64, u64, BuildId)> =
            merged.iter().map(|m| (m.offset, m.length, m.build_id)).collect();
        assert_eq!(
            got,
            vec![(0, 2 * B, a), (2 * B, 4 * B, d), (6 * B, 2 * B, b)]
        );
        // Left survivor keeps its storage; right survivor shifts by 2 blocks.
        assert_eq!(merged[0].build_storage_offset, 0);
        assert_eq!(merged[2].build_storage_offset, 2 * B);
    }

    #[test]
    fn merge_multiple_diffs_one_base() {
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        let base = vec![map(0, 8 * B, a, 0)];
        let diff = vec![map(B, B, d, 0), map(4 * B, B, d, B)];
        let merged = merge_mappings(&base, &diff).unwrap();
        let got: Vec<(u64, u64, BuildId)> =
            merged.iter().map(|m| (m.offset, m.length, m.build_id)).collect();
        assert_eq!(
            got,
            vec![
                (0, B, a),
                (B, B, d),
                (2 * B, 2 * B, a),
                (4 * B, B, d),
                (5 * B, 3 * B, a),
            ]
        );
        validate_mappings(&merged, 8 * B, B).unwrap();
    }

    #[test]
    fn merge_strictly_increasing_no_gaps() {
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        let base = vec![map(0, 16 * B, a, 0)];
        let diff = vec![map(0, B, d, 0), map(3 * B, 2 * B, d, B), map(15 * B, B, d, 3 * B)];
        let merged = merge_mappings(&base, &diff).unwrap();
        for pair in merged.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
        validate_mappings(&merged, 16 * B, B).unwrap();
    }

    #[test]
    fn merge_split_carries_frame_subsets() {
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        // Base map with a frame per block, storage starting at 0.
        let frames: Vec<FrameSize> = (0..4)
            .map(|i| FrameSize {
                uncompressed: B as u32,
                compressed: 100 + i,
            })
            .collect();
        let table = Arc::new(FrameTable::new(CompressionType::Zstd, 0, 0, frames));
        let base = vec![BuildMap {
            offset: 0,
            length: 4 * B,
            build_id: a,
            build_storage_offset: 0,
            frames: Some(table),
        }];
        let diff = vec![map(B, B, d, 0)];

        let merged = merge_mappings(&base, &diff).unwrap();
        assert_eq!(merged.len(), 3);

        let left = merged[0].frames.as_ref().unwrap();
        assert_eq!(left.frame_count(), 1);
        assert_eq!(left.start_uncompressed(), 0);

        let right = merged[2].frames.as_ref().unwrap();
        assert_eq!(right.frame_count(), 2);
        assert_eq!(right.start_uncompressed(), 2 * B);
        // Compressed start skips the first two frames (100 + 101 bytes).
        assert_eq!(right.start_compressed(), 201);
    }

    #[test]
    fn normalize_merges_three_adjacent() {
        let a = Uuid::new_v4();
        let maps = vec![
            map(0, 2 * B, a, 0),
            map(2 * B, 3 * B, a, 2 * B),
            map(5 * B, B, a, 5 * B),
        ];
        let normalized = normalize_mappings(&maps);
        assert_eq!(normalized.len(), 1);
        assert_eq!((normalized[0].offset, normalized[0].length), (0, 6 * B));
        // Input untouched.
        assert_eq!(maps.len(), 3);
    }

    #[test]
    fn normalize_respects_storage_discontinuity() {
        let a = Uuid::new_v4();
        // Logically adjacent but the storage jumps: must not join.
        let maps = vec![map(0, 2 * B, a, 0), map(2 * B, 2 * B, a, 10 * B)];
        assert_eq!(normalize_mappings(&maps).len(), 2);
    }

    #[test]
    fn normalize_joins_nil_builds_regardless_of_storage() {
        let maps = vec![
            map(0, 2 * B, NIL_BUILD_ID, 0),
            map(2 * B, 2 * B, NIL_BUILD_ID, 999),
        ];
        assert_eq!(normalize_mappings(&maps).len(), 1);
    }

    #[test]
    fn normalize_idempotent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let maps = vec![
            map(0, B, a, 0),
            map(B, B, a, B),
            map(2 * B, B, b, 0),
            map(3 * B, B, a, 0),
        ];
        let once = normalize_mappings(&maps);
        let twice = normalize_mappings(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn normalize_joins_frame_tables() {
        let a = Uuid::new_v4();
        let t1 = Arc::new(FrameTable::new(
            CompressionType::Zstd,
            0,
            0,
            vec![FrameSize {
                uncompressed: (2 * B) as u32,
                compressed: 500,
            }],
        ));
        let t2 = Arc::new(FrameTable::new(
            CompressionType::Zstd,
            2 * B,
            500,
            vec![FrameSize {
                uncompressed: B as u32,
                compressed: 300,
            }],
        ));
        let maps = vec![
            BuildMap {
                offset: 0,
                length: 2 * B,
                build_id: a,
                build_storage_offset: 0,
                frames: Some(t1),
            },
            BuildMap {
                offset: 2 * B,
                length: B,
                build_id: a,
                build_storage_offset: 2 * B,
                frames: Some(t2),
            },
        ];
        let normalized = normalize_mappings(&maps);
        assert_eq!(normalized.len(), 1);
        let joined = normalized[0].frames.as_ref().unwrap();
        assert_eq!(joined.frame_count(), 2);
        assert_eq!(joined.uncompressed_len(), 3 * B);
    }

    #[test]
    fn normalize_keeps_presence_mismatch_apart() {
        let a = Uuid::new_v4();
        let t = Arc::new(FrameTable::new(
            CompressionType::Zstd,
            0,
            0,
            vec![FrameSize {
                uncompressed: B as u32,
                compressed: 10,
            }],
        ));
        let maps = vec![
            BuildMap {
                offset: 0,
                length: B,
                build_id: a,
                build_storage_offset: 0,
                frames: Some(t),
            },
            map(B, B, a, B),
        ];
        assert_eq!(normalize_mappings(&maps).len(), 2);
    }

    #[test]
    fn validate_rejects_bad_inputs() {
        let a = Uuid::new_v4();
        assert!(matches!(
            validate_mappings(&[map(0, B, a, 0)], B, 0),
            Err(Error::ZeroBlockSize)
        ));
        assert!(matches!(
            validate_mappings(&[map(B, B, a, 0)], 2 * B, B),
            Err(Error::MappingDiscontiguous { .. })
        ));
        assert!(matches!(
            validate_mappings(&[map(0, B + 1, a, 0)], B + 1, B),
            Err(Error::MappingUnaligned { .. })
        ));
        assert!(matches!(
            validate_mappings(&[map(0, B, a, 0)], 2 * B, B),
            Err(Error::MappingCoverage { .. })
        ));
        validate_mappings(&[map(0, 2 * B, a, 0)], 2 * B, B).unwrap();
    }
}
