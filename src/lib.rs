//! certshard ingests Certificate Transparency logs into a universe of
//! (expiration-date × issuer) shards: raw certificates land as PEM documents
//! in a durable document store, while per-shard membership and issuer
//! metadata accumulate in a remote in-memory cache. Downstream consumers
//! read the shards to build revocation artifacts.

pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod follower;
pub mod ids;
pub mod known;
pub mod metadata;
pub mod stats;
pub mod storage;
pub mod supervisor;

// Re-export commonly used types
pub use crate::cli::Args;
pub use crate::config::CTConfig;
pub use crate::db::CertDatabase;
pub use crate::error::IngestError;

/// Result type for certshard operations
pub type Result<T> = std::result::Result<T, IngestError>;
