// End-to-end overlay lifecycle: serve a template lazily from a provider,
// run "guest" writes through the copy-on-write overlay, pause, build the
// diff, and stitch the next build's header from it.

use std::sync::Arc;

use anyhow::Result;
use sediment::block::{block_count, ROOTFS_BLOCK_SIZE};
use sediment::cache::mmap::MmapCache;
use sediment::cache::overlay::Overlay;
use sediment::diff::build_diff;
use sediment::header::{merge_mappings, normalize_mappings, validate_mappings, Header, Metadata};
use sediment::storage::lazy::LazyStorage;
use sediment::storage::local::LocalBackend;
use sediment::storage::{Device, StorageProvider, StoreOptions};
use sediment::sync::cancel::CancelToken;
use sediment::HUGEPAGE_SIZE;
use tempfile::TempDir;
use uuid::Uuid;

const BS: u64 = ROOTFS_BLOCK_SIZE;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn overlay_cow_and_finalize() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let token = CancelToken::never();

    // One hugepage of template data, stored uncompressed.
    let size = HUGEPAGE_SIZE;
    let template: Vec<u8> = (0..size).map(|i| ((i % 191) + 1) as u8).collect();
    let backend = Arc::new(LocalBackend::new(dir.path().join("store"))?);
    let src = dir.path().join("template.bin");
    std::fs::write(&src, &template)?;
    backend.store_file(&src, "builds/base/rootfs", &StoreOptions::uncompressed(), &token)?;

    // Lazy device over the stored object.
    let lazy = Arc::new(LazyStorage::new(
        backend.clone(),
        "builds/base/rootfs",
        size,
        BS,
        &dir.path().join("lazy-cache.bin"),
        None,
        None,
        false,
    )?);

    // COW overlay for a running sandbox.
    let overlay_cache = MmapCache::new(size, BS, &dir.path().join("overlay-cache.bin"))?;
    let overlay = Overlay::new(lazy.clone(), overlay_cache);

    // Untouched reads fall through to the template.
    let mut buf = vec![0u8; BS as usize];
    overlay.read_at(&mut buf, 3 * BS, &token)?;
    assert_eq!(&buf[..], &template[(3 * BS) as usize..(4 * BS) as usize]);

    // Guest writes: block 1 rewritten, block 5 zeroed.
    let written = vec![0xC3u8; BS as usize];
    overlay.write_at(&written, BS)?;
    overlay.write_at(&vec![0u8; BS as usize], 5 * BS)?;

    // Reads see the last write, not the template.
    overlay.read_at(&mut buf, BS, &token)?;
    assert_eq!(buf, written);

    // Pause: diff the overlay against the original.
    let original = MmapCache::new(size, BS, &dir.path().join("orig.bin"))?;
    original.write_at(&template, 0)?;

    let mut big_dirty = sediment::marker::BlockSet::new(block_count(size, HUGEPAGE_SIZE));
    big_dirty.set(0);

    let mut diff_blob = Vec::new();
    let meta = build_diff(
        &overlay,
        &original,
        &big_dirty,
        size,
        BS,
        &mut diff_blob,
        &token,
    )?;

    let dirty: Vec<u64> = meta.dirty.iter_set().collect();
    let empty: Vec<u64> = meta.empty.iter_set().collect();
    assert_eq!(dirty, vec![1], "only the rewritten block carries bytes");
    assert_eq!(empty, vec![5], "the zeroed block becomes a marker");
    assert_eq!(diff_blob.len(), BS as usize);
    assert!(diff_blob.iter().all(|&b| b == 0xC3));

    // Stitch the next build's header.
    let base_id = Uuid::new_v4();
    let child_id = Uuid::new_v4();
    let base_metadata = Metadata {
        version: 4,
        generation: 0,
        block_size: BS,
        size,
        build_id: base_id,
        base_build_id: base_id,
    };
    let base_header = Header::new(
        base_metadata,
        vec![sediment::header::BuildMap {
            offset: 0,
            length: size,
            build_id: base_id,
            build_storage_offset: 0,
            frames: None,
        }],
    )?;

    let diff_maps = meta.build_maps(child_id);
    let merged = merge_mappings(base_header.mapping(), &diff_maps)?;
    let normalized = normalize_mappings(&merged);
    validate_mappings(&normalized, size, BS)?;

    let child_metadata = base_header.metadata().next_generation(child_id);
    let child = Header::new(child_metadata, normalized)?;
    assert_eq!(child.metadata().generation, 1);
    assert_eq!(child.metadata().base_build_id, base_id);

    // The child header resolves each region to the right build.
    assert_eq!(child.get_shifted_mapping(0)?.build_id, base_id);
    let s = child.get_shifted_mapping(BS)?;
    assert_eq!(s.build_id, child_id);
    assert_eq!(s.storage_offset, 0, "diff storage is dense from zero");
    assert_eq!(
        child.get_shifted_mapping(5 * BS)?.build_id,
        sediment::NIL_BUILD_ID
    );
    assert_eq!(child.get_shifted_mapping(6 * BS)?.build_id, base_id);

    overlay.close()?;
    lazy.close()?;
    Ok(())
}

#[test]
fn overlay_slice_and_sync() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let token = CancelToken::never();

    let size = 8 * BS;
    let template = vec![0x5Au8; size as usize];
    let backend = Arc::new(LocalBackend::new(dir.path().join("store"))?);
    let src = dir.path().join("t.bin");
    std::fs::write(&src, &template)?;
    backend.store_file(&src, "obj", &StoreOptions::uncompressed(), &token)?;

    let lazy = Arc::new(LazyStorage::new(
        backend,
        "obj",
        size,
        BS,
        &dir.path().join("lazy.bin"),
        None,
        None,
        false,
    )?);
    let overlay = Overlay::new(
        lazy.clone(),
        MmapCache::new(size, BS, &dir.path().join("ov.bin"))?,
    );

    let view = overlay.slice(100, 200, &token)?;
    assert!(view.iter().all(|&b| b == 0x5A));
    overlay.sync()?;
    overlay.close()?;
    lazy.close()?;
    Ok(())
}
