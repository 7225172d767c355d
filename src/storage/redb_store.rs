//! redb storage backend: a single `kv` table of string keys and values.
//!
//! Transactions are short and local, so the async trait methods call
//! straight through to redb.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::KvStorage;

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    /// Open (or create) the store at the default data-dir location.
    pub fn new() -> Result<Self> {
        Self::open(&Self::default_path()?)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create storage directory")?;
        }
        let db = Database::create(path)
            .with_context(|| format!("Failed to open favsync database at {}", path.display()))?;
        // Ensure table exists so read transactions never miss it
        let txn = db.begin_write()?;
        { let _ = txn.open_table(KV_TABLE)?; }
        txn.commit()?;
        Ok(Self { db })
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("favsync");
        Ok(data_dir.join("favsync.redb"))
    }

    /// Keys currently stored, in ascending order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(KV_TABLE)?;
        let keys = table
            .iter()?
            .map(|r| r.map(|(k, _)| k.value().to_string()))
            .collect::<std::result::Result<_, _>>()?;
        Ok(keys)
    }
}

#[async_trait]
impl KvStorage for RedbStorage {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(KV_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }
}
