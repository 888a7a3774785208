// Header serialization round-trips across format versions.

use std::sync::Arc;

use sediment::frame::{CompressionType, FrameSize, FrameTable};
use sediment::header::{validate_mappings, BuildMap, Header, Metadata};
use uuid::Uuid;

const B: u64 = 4096;

fn one_frame_table() -> FrameTable {
    FrameTable::new(
        CompressionType::Zstd,
        0,
        0,
        vec![FrameSize {
            uncompressed: (4 * B) as u32,
            compressed: 999,
        }],
    )
}

/// A v4 one-map, one-frame header round-trips intact; the
/// same input written at v3 deserializes with a nil frame table.
#[test]
fn v4_roundtrip_and_v3_downgrade() {
    let build = Uuid::new_v4();
    let base = Uuid::new_v4();

    let metadata_v4 = Metadata {
        version: 4,
        generation: 1,
        block_size: B,
        size: 4 * B,
        build_id: build,
        base_build_id: base,
    };
    let maps = vec![BuildMap {
        offset: 0,
        length: 4 * B,
        build_id: build,
        build_storage_offset: 0,
        frames: Some(Arc::new(one_frame_table())),
    }];

    let h4 = Header::new(metadata_v4, maps.clone()).unwrap();
    let bytes = h4.serialize().unwrap();
    let restored = Header::deserialize(&bytes).unwrap();

    assert_eq!(restored.metadata(), &metadata_v4);
    assert_eq!(restored.mapping(), h4.mapping());
    let table = restored.mapping()[0].frames.as_ref().unwrap();
    assert_eq!(table.as_ref(), &one_frame_table());

    // Same mapping at version 3: frames are dropped on the wire.
    let metadata_v3 = Metadata {
        version: 3,
        ..metadata_v4
    };
    let h3 = Header::new(metadata_v3, maps).unwrap();
    let restored3 = Header::deserialize(&h3.serialize().unwrap()).unwrap();
    assert_eq!(restored3.metadata(), &metadata_v3);
    assert!(restored3.mapping()[0].frames.is_none());
    assert_eq!(
        restored3.mapping()[0].build_storage_offset,
        h3.mapping()[0].build_storage_offset
    );
}

/// Coverage invariant: any header that deserializes validates.
#[test]
fn deserialized_headers_always_validate() {
    let build = Uuid::new_v4();
    let other = Uuid::new_v4();
    let metadata = Metadata {
        version: 4,
        generation: 9,
        block_size: B,
        size: 10 * B,
        build_id: build,
        base_build_id: other,
    };
    let maps = vec![
        BuildMap {
            offset: 0,
            length: 6 * B,
            build_id: other,
            build_storage_offset: 2 * B,
            frames: None,
        },
        BuildMap {
            offset: 6 * B,
            length: 4 * B,
            build_id: build,
            build_storage_offset: 0,
            frames: None,
        },
    ];
    let header = Header::new(metadata, maps).unwrap();
    let restored = Header::deserialize(&header.serialize().unwrap()).unwrap();
    validate_mappings(
        restored.mapping(),
        restored.size(),
        restored.block_size(),
    )
    .unwrap();
}

/// A record-less header synthesizes one full-range map owned by the build.
#[test]
fn empty_header_synthesizes_full_range_map() {
    let build = Uuid::new_v4();
    let metadata = Metadata {
        version: 2,
        generation: 0,
        block_size: B,
        size: 16 * B,
        build_id: build,
        base_build_id: build,
    };
    let bytes = sediment::header::serialize::serialize(&metadata, &[]).unwrap();
    let restored = Header::deserialize(&bytes).unwrap();
    assert_eq!(restored.mapping().len(), 1);
    let only = &restored.mapping()[0];
    assert_eq!((only.offset, only.length), (0, 16 * B));
    assert_eq!(only.build_id, build);
}

#[test]
fn shifted_lookup_after_roundtrip() {
    let build = Uuid::new_v4();
    let ancestor = Uuid::new_v4();
    let metadata = Metadata {
        version: 4,
        generation: 3,
        block_size: B,
        size: 8 * B,
        build_id: build,
        base_build_id: ancestor,
    };
    let maps = vec![
        BuildMap {
            offset: 0,
            length: 4 * B,
            build_id: ancestor,
            build_storage_offset: 12 * B,
            frames: None,
        },
        BuildMap {
            offset: 4 * B,
            length: 4 * B,
            build_id: build,
            build_storage_offset: 0,
            frames: None,
        },
    ];
    let header = Header::new(metadata, maps).unwrap();
    let restored = Header::deserialize(&header.serialize().unwrap()).unwrap();

    let s = restored.get_shifted_mapping(B + 100).unwrap();
    assert_eq!(s.build_id, ancestor);
    assert_eq!(s.storage_offset, 12 * B + B + 100);
    assert_eq!(s.length, 3 * B - 100);

    let s = restored.get_shifted_mapping(7 * B).unwrap();
    assert_eq!(s.build_id, build);
    assert_eq!(s.storage_offset, 3 * B);
    assert_eq!(s.length, B);
}
