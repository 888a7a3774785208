//! Coordination primitives used across the storage engine.
//!
//! Everything here is synchronous and cancellation-aware: blocking calls take
//! a [`cancel::CancelToken`] and return [`crate::Error::Canceled`] promptly
//! when the matching source fires.

pub mod cancel;
pub mod counter;
pub mod keymutex;
pub mod once;
pub mod semaphore;
pub mod singleflight;
pub mod waitmap;

pub use cancel::{CancelSource, CancelToken};
pub use counter::{SettleCounter, WaitCounter};
pub use keymutex::KeyMutex;
pub use once::{ErrorOnce, SetOnce};
pub use semaphore::AdjustableSemaphore;
pub use singleflight::Singleflight;
pub use waitmap::WaitMap;
