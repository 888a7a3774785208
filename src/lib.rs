// sediment — content-addressed, layered block storage for microVM templates.

pub mod block;
pub mod cache;
pub mod diff;
pub mod error;
pub mod frame;
pub mod header;
pub mod marker;
pub mod nfs;
pub mod pool;
pub mod sandbox;
pub mod storage;
pub mod sync;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// Crate-wide error type; every public operation returns [`Result`].
pub use error::{Error, Result};

/// Block math: the smallest addressable unit and the fetch unit.
pub use block::{CHUNK_SIZE, HUGEPAGE_SIZE, ROOTFS_BLOCK_SIZE};

/// Layered address-space description for one build.
pub use header::{BuildId, BuildMap, Header, Metadata, NIL_BUILD_ID};

/// Per-frame compression index for framed storage.
pub use frame::{CompressionType, FrameTable};

/// The mmap-backed local cache and the lazy-fetch read path.
pub use cache::chunker::Chunker;
pub use cache::mmap::MmapCache;
pub use cache::overlay::Overlay;

/// Storage backends and the device surface served to the hypervisor.
pub use storage::{Device, ObjectSize, ReaderAt, Slicer, StorageProvider, StoreOptions};

/// Shared-filesystem second cache tier.
pub use nfs::NfsCache;

/// Sandbox lifecycle store consumed by the API layer.
pub use sandbox::{MemoryStore, Removal, RemoveAction, Sandbox, SandboxState};

/// Generic fresh-vs-reusable resource pool.
pub use pool::{PoolConfig, WarmPool};

/// Coordination primitives used by the serving layer.
pub use sync::cancel::{CancelSource, CancelToken};
pub use sync::once::{ErrorOnce, SetOnce};
pub use sync::semaphore::AdjustableSemaphore;
