//! Fleet Storage - Document Store and Consistency Layer
//!
//! Persists fleet entities in a document engine and keeps cross-entity
//! facts consistent: list/resolve queries share one composable builder,
//! multi-collection writes run as transactional cascades, and hot records
//! are served cache-aside with explicit invalidation.

pub mod cache;
pub mod cascade;
pub mod config;
pub mod conflict;
pub mod document;
pub mod engine;
pub mod presence;
pub mod query;
pub mod resolver;
pub mod store;

pub use cache::{
    CacheAside, CacheBackend, CacheError, CacheKey, CacheStats, Cacheable, InMemoryCacheBackend,
    LmdbCacheBackend, LmdbCacheError,
};
pub use cascade::{run_cascade, Cascade};
pub use config::StoreConfig;
pub use conflict::{check_conflicts, ApiKeyCandidate, ConflictCandidate, UserCandidate};
pub use engine::{
    Collection, Document, DocumentEngine, EngineError, Executor, Expr, InMemoryEngine, Operation,
    Pipeline, SortKey, SortOrder, Stage, Transaction, TxnOptions, UpdateOutcome, UpdateSpec,
};
pub use presence::{is_online, online_cutoff};
pub use query::{Paginator, Query, QueryOption, DEFAULT_PER_PAGE, MAX_PER_PAGE};
pub use resolver::{
    ApiKeyResolver, DeviceResolver, FirewallRuleResolver, NamespaceResolver, PublicKeyResolver,
    Resolver, SessionResolver, UserResolver,
};
pub use store::Store;
