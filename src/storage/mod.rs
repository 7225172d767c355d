//! Storage abstraction for favsync.
//!
//! - [`RedbStorage`]: redb file on disk (default, survives restarts)
//! - [`MemoryStorage`]: process-local map (tests, throwaway sessions)
//!
//! The session credential and every per-identity favorites record live in
//! the same key-value space. Callers hold an `Arc<dyn KvStorage>`.

pub mod memory;
pub mod redb_store;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryStorage;
pub use redb_store::RedbStorage;

/// String key-value storage, read and written as whole values.
///
/// All methods are async so a remote or blocking backend can sit behind
/// the same interface as the in-memory one.
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    /// Read the value stored at `key`. Returns None if nothing is stored.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite the value at `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
