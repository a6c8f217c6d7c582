//! Cache layer.
//!
//! A byte-oriented [`CacheBackend`] (in-memory or LMDB) behind a typed
//! [`CacheAside`] accessor. Keys are [`CacheKey`]s, which can only be built
//! from an entity kind plus an identifier.

pub mod aside;
pub mod key;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use aside::CacheAside;
pub use key::CacheKey;
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory::InMemoryCacheBackend;
pub use traits::{CacheBackend, CacheError, CacheStats, Cacheable};
