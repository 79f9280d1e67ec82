//! restfed core library.
//!
//! This crate provides the components of a one-way REST user directory to
//! local identity store federation: configuration, the remote directory
//! client, record deduplication, identity projection, SQLite persistence,
//! post-creation notification, and the sync engine.

pub mod config;
pub mod dedup;
pub mod env_subst;
pub mod errors;
pub mod models;
pub mod notify;
pub mod projector;
pub mod remote;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use dedup::Deduplicator;
pub use models::{LocalIdentity, RemoteRecord, SyncMode, SyncResult};
pub use projector::{IdentityProjector, NameNormalizer};
pub use remote::{DirectoryPort, PageFetcher, RestDirectoryClient};
pub use store::{Database, IdentityStore, SqliteIdentityStore, StoreSession};
pub use sync_engine::SyncEngine;
