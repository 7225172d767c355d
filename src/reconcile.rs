//! Local/remote favorites merge.

use std::collections::HashSet;

use crate::favorite::{FavoriteItem, FavoriteKey};

/// Merge `remote` into `local`, keeping local entries on key conflicts.
///
/// Order is local first, then remote-only items in fetch order. Duplicate
/// keys within either list collapse to their first occurrence.
pub fn merge(local: Vec<FavoriteItem>, remote: Vec<FavoriteItem>) -> Vec<FavoriteItem> {
    let mut seen: HashSet<FavoriteKey> = HashSet::with_capacity(local.len() + remote.len());
    let mut merged = Vec::with_capacity(local.len() + remote.len());

    for item in local.into_iter().chain(remote) {
        if seen.insert(item.key()) {
            merged.push(item);
        }
    }
    merged
}
