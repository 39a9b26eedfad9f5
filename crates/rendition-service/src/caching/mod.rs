//! # Rendition caching infrastructure
//!
//! Decoded renditions are expensive to produce: they need a download, possibly a disk write,
//! and a decode. This module holds the two cache tiers that avoid redoing that work, the
//! [`CacheError`] type shared by the whole crate, and the [`CacheCoordinator`] which ties the
//! tiers together.
//!
//! ## Cache Layers
//!
//! - The [`MemoryStore`] keeps decoded payloads in process memory. It is bounded by the decoded
//!   byte footprint of its entries and evicts in least-recently-used order. Memory-pressure
//!   signals trim it to half its usage or empty it entirely.
//! - The [`PersistentStore`] keeps the raw downloaded bytes on the file system. It is bounded by
//!   total file size, evicts whole entries in least-recently-used order, and is versioned by a
//!   generation number. Entries become visible only through an atomic commit.
//!
//! A lookup goes through the following steps:
//! - The memory tier at the size-specific key, then at the size-agnostic key.
//! - On miss, the persistent tier at the size-specific key, then at the size-agnostic key. A hit
//!   is decoded off the calling context and, if configured, written back to the memory tier.
//! - On miss, the caller is told so and is expected to start (or join) a fetch.
//!
//! Failures of the persistent tier never surface to callers. They are logged and treated as a
//! miss.
//!
//! ### Metrics
//!
//! - `caches.memory.hit` / `caches.memory.miss`: Lookups served (or not) by the memory tier.
//! - `caches.memory.evicted`: Entries dropped from the memory tier to stay within budget.
//! - `caches.memory.size`: Current byte usage of the memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Lookups served (or not) by the persistent tier.
//! - `caches.file.evicted`: Entries deleted from disk to stay within budget.
//! - `caches.file.size`: Current byte usage of the persistent tier.
//! - `caches.file.write`: Committed entries.

mod cache_error;
mod cache_key;
mod coordinator;
mod memory;
mod persistent;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use coordinator::CacheCoordinator;
pub use memory::{MemoryPressure, MemoryStore};
pub use persistent::{Editor, PersistentStore};
