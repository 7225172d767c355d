//! Per-identity favorites records, stored as a JSON array under
//! `favorites_<identity>`.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::favorite::FavoriteItem;
use crate::storage::KvStorage;

const RECORD_PREFIX: &str = "favorites_";

pub fn record_key(identity: &str) -> String {
    format!("{RECORD_PREFIX}{identity}")
}

#[derive(Clone)]
pub struct LocalFavoritesStore {
    storage: Arc<dyn KvStorage>,
}

impl LocalFavoritesStore {
    pub fn new(storage: Arc<dyn KvStorage>) -> Self {
        Self { storage }
    }

    /// Load the record for `identity`.
    ///
    /// Missing identity, missing record, unreadable storage and corrupt
    /// JSON all come back as an empty list.
    pub async fn load(&self, identity: Option<&str>) -> Vec<FavoriteItem> {
        let Some(identity) = identity else {
            return Vec::new();
        };
        let key = record_key(identity);

        let contents = match self.storage.get(&key).await {
            Ok(Some(c)) => c,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Could not read favorites record {}: {}", key, e);
                return Vec::new();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Favorites record {} corrupt, starting fresh: {}", key, e);
                Vec::new()
            }
        }
    }

    /// Overwrite the record for `identity`. No-op without an identity.
    pub async fn save(&self, identity: Option<&str>, items: &[FavoriteItem]) -> Result<()> {
        let Some(identity) = identity else {
            return Ok(());
        };
        let contents = serde_json::to_string(items)
            .context("Failed to serialize favorites")?;
        self.storage
            .set(&record_key(identity), &contents)
            .await
            .with_context(|| format!("Failed to write favorites record for {identity}"))
    }

    /// Remove the record for `identity`. No-op without an identity.
    pub async fn delete(&self, identity: Option<&str>) -> Result<()> {
        let Some(identity) = identity.filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        self.storage
            .remove(&record_key(identity))
            .await
            .with_context(|| format!("Failed to delete favorites record for {identity}"))
    }
}
