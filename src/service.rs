//! The favorites service: one shared, identity-scoped favorites set.
//!
//! The in-memory set is authoritative for the process lifetime and is
//! written through to the [`LocalFavoritesStore`] after every mutation.
//! On each identity change the set is rebuilt from the local record and
//! the backend, local entries winning.
//!
//! Identity transitions are serialized, backend fetches are not. Each
//! reconciliation takes a generation number when it starts; `clear()` or a
//! newer reconciliation bumps it, and a reconciliation that finds its
//! generation superseded drops its result. A hung fetch for one identity
//! therefore never holds up a switch to the next.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::watch;

use crate::credential::CredentialReader;
use crate::favorite::{listing_id, Category, FavoriteItem};
use crate::identity::{IdentityChange, IdentityResolver, SessionSource};
use crate::local::LocalFavoritesStore;
use crate::reconcile::merge;
use crate::remote::RemoteFavorites;
use crate::storage::KvStorage;

#[derive(Default)]
struct FavoritesState {
    /// Identity the current `items` belong to.
    owner: Option<String>,
    items: Vec<FavoriteItem>,
    generation: u64,
}

pub struct FavoritesService {
    resolver: IdentityResolver,
    local: LocalFavoritesStore,
    remote: Arc<dyn RemoteFavorites>,
    state: Mutex<FavoritesState>,
    published: watch::Sender<Vec<FavoriteItem>>,
    transition_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FavoritesService {
    pub fn new(
        resolver: IdentityResolver,
        local: LocalFavoritesStore,
        remote: Arc<dyn RemoteFavorites>,
    ) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            resolver,
            local,
            remote,
            state: Mutex::new(FavoritesState::default()),
            published,
            transition_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Wire a service over one storage holding both the credential (at
    /// `credential_key`) and the favorites records.
    pub fn with_storage(
        storage: Arc<dyn KvStorage>,
        credential_key: &str,
        session: Arc<dyn SessionSource>,
        remote: Arc<dyn RemoteFavorites>,
    ) -> Self {
        let credentials = CredentialReader::new(storage.clone(), credential_key);
        Self::new(
            IdentityResolver::new(session, credentials),
            LocalFavoritesStore::new(storage),
            remote,
        )
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn credentials(&self) -> &CredentialReader {
        self.resolver.credentials()
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Re-resolve the identity; reconcile if it changed.
    pub async fn resolve(&self) -> Option<IdentityChange> {
        let transition = self.transition_lock.lock().await;
        let change = self.resolver.poll().await?;
        self.reconcile(change.current_id().map(String::from), transition)
            .await;
        Some(change)
    }

    /// Force a reconciliation for whatever identity resolves now.
    pub async fn refresh(&self) {
        let transition = self.transition_lock.lock().await;
        let _ = self.resolver.poll().await;
        self.reconcile(self.resolver.last_known(), transition).await;
    }

    /// Identity the favorites set is currently scoped to.
    pub fn current_identity(&self) -> Option<String> {
        self.resolver.last_known()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn is_favorite(&self, id: &str, category: Category) -> bool {
        self.lock_state().items.iter().any(|i| i.matches(id, category))
    }

    /// Snapshot of the current favorites.
    pub fn favorites(&self) -> Vec<FavoriteItem> {
        self.lock_state().items.clone()
    }

    pub fn favorites_in(&self, category: Category) -> Vec<FavoriteItem> {
        self.lock_state()
            .items
            .iter()
            .filter(|i| i.category == category)
            .cloned()
            .collect()
    }

    /// Receive the favorites list every time it changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<FavoriteItem>> {
        self.published.subscribe()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Add `item` unless its `(category, id)` is already present.
    /// Returns whether the set changed.
    pub async fn add(&self, mut item: FavoriteItem) -> bool {
        item.added_at.get_or_insert_with(Utc::now);
        let changed = self.mutate(|items| {
            if items.iter().any(|i| i.matches(&item.id, item.category)) {
                return false;
            }
            items.push(item);
            true
        });
        if changed {
            self.persist_current().await;
        }
        changed
    }

    /// Remove the favorite with this `(category, id)`, if present.
    pub async fn remove(&self, id: &str, category: Category) -> bool {
        let changed = self.mutate(|items| {
            let before = items.len();
            items.retain(|i| !i.matches(id, category));
            items.len() != before
        });
        if changed {
            self.persist_current().await;
        }
        changed
    }

    /// Flip membership of `(category, id)`, using `snapshot` as the payload
    /// when adding. Returns the new membership.
    pub async fn toggle(&self, id: &str, category: Category, snapshot: Value) -> bool {
        if self.is_favorite(id, category) {
            self.remove(id, category).await;
            false
        } else {
            self.add(FavoriteItem::new(id, category, snapshot)).await;
            true
        }
    }

    /// `toggle` for a raw backend listing, taking the id from the listing.
    /// Returns None if the listing carries no identifier.
    pub async fn toggle_listing(&self, category: Category, listing: Value) -> Option<bool> {
        let id = listing_id(category, &listing)?;
        Some(self.toggle(&id, category, listing).await)
    }

    /// Drop all favorites state for the current session.
    ///
    /// Empties the set, deletes the record of the current identity and of
    /// any identity still decodable from a lingering credential, and forgets
    /// the last-known identity so the next resolution starts fresh.
    pub async fn clear(&self) {
        let owner = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.items.clear();
            self.published.send_replace(Vec::new());
            state.owner.take()
        };
        let last_known = self.resolver.reset();
        let lingering = self.credentials().read_subject().await;

        let mut targets: Vec<String> = Vec::new();
        for id in [owner, last_known, lingering].into_iter().flatten() {
            if !targets.contains(&id) {
                targets.push(id);
            }
        }

        let _writing = self.write_lock.lock().await;
        for id in &targets {
            if let Err(e) = self.local.delete(Some(id)).await {
                tracing::warn!("Could not delete favorites record: {:#}", e);
            }
        }
        tracing::info!("Favorites cleared ({} records removed)", targets.len());
    }

    /// Clear if the credential has disappeared while an identity is still
    /// resolved. Returns whether a clear happened.
    pub async fn detect_logout(&self) -> bool {
        if self.credentials().read_credential().await.is_some() {
            return false;
        }
        let resolved = self.current_identity().is_some() || self.lock_state().owner.is_some();
        if !resolved {
            return false;
        }
        tracing::info!("Credential removed, clearing favorites");
        self.clear().await;
        true
    }

    // ── Internals ────────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, FavoritesState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the set and publish if it reports a change.
    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Vec<FavoriteItem>) -> bool,
    {
        let mut state = self.lock_state();
        let changed = f(&mut state.items);
        if changed {
            self.published.send_replace(state.items.clone());
        }
        changed
    }

    /// Write the latest set to its owner's record. Failures are logged.
    async fn persist_current(&self) {
        let _writing = self.write_lock.lock().await;
        let (owner, items) = {
            let state = self.lock_state();
            (state.owner.clone(), state.items.clone())
        };
        if let Err(e) = self.local.save(owner.as_deref(), &items).await {
            tracing::warn!("Favorites write-through failed: {:#}", e);
        }
    }

    /// Rebuild the set for `identity`.
    ///
    /// `transition` is released once the set has been handed to `identity`,
    /// before any backend call.
    async fn reconcile(
        &self,
        identity: Option<String>,
        transition: tokio::sync::MutexGuard<'_, ()>,
    ) {
        // Held across the local load so a write-through racing it lands
        // after the merge, on the new owner's record.
        let writing = self.write_lock.lock().await;
        let (generation, fresh) = {
            let mut state = self.lock_state();
            state.generation += 1;
            let fresh = identity.is_none() || state.owner != identity;
            if fresh {
                state.owner = identity.clone();
                state.items.clear();
                self.published.send_replace(Vec::new());
            }
            (state.generation, fresh)
        };
        drop(transition);

        let Some(identity) = identity else {
            return;
        };

        // Local record first, so cached favorites show up without waiting
        // on the backend. A set already owned by this identity is newer
        // than its record.
        if fresh {
            let local = self.local.load(Some(&identity)).await;
            let mut state = self.lock_state();
            if state.generation != generation {
                tracing::debug!("Reconciliation for {} superseded", identity);
                return;
            }
            let current = std::mem::take(&mut state.items);
            state.items = merge(current, local);
            self.published.send_replace(state.items.clone());
        }
        drop(writing);

        let remote = self.fetch_remote(&identity).await;
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                tracing::debug!("Reconciliation for {} superseded", identity);
                return;
            }
            let current = std::mem::take(&mut state.items);
            state.items = merge(current, remote);
            self.published.send_replace(state.items.clone());
            tracing::debug!("Reconciled {} favorites for {}", state.items.len(), identity);
        }

        self.persist_current().await;
    }

    async fn fetch_remote(&self, identity: &str) -> Vec<FavoriteItem> {
        let fetches = Category::ALL.iter().map(|&category| async move {
            match self.remote.fetch(identity, category).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!("Remote {} favorites unavailable for {}: {}", category, identity, e);
                    Vec::new()
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }
}
