//! Versioned response cache.
//!
//! This module provides the persistent side of the worker:
//! - Responses are partitioned into named caches, one per cache version
//! - Entries are addressed by normalized request identity
//! - Each cache remembers the asset manifest it was installed from and
//!   whether that install settled

mod key;
mod storage;
mod traits;

pub use key::RequestKey;
pub use storage::{CacheInfo, CacheStorage, CachedEntry, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
