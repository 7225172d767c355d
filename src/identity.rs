//! Effective-identity resolution.
//!
//! Who is logged in is derived, in priority order, from the session's
//! profile id, the session's user id, and finally the subject decoded from
//! the stored bearer credential. [`IdentityResolver`] is the only place that
//! order is applied.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::credential::CredentialReader;

/// External session-management collaborator.
///
/// Identities are polled on every resolution; no push contract is required.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Identifier of the loaded profile object, if any.
    fn profile_id(&self) -> Option<String>;

    /// Identifier of the cached user object, if any.
    fn user_id(&self) -> Option<String>;

    /// Ask the profile store to populate itself for `identity`.
    async fn load_profile(&self, _identity: &str) -> Result<()> {
        Ok(())
    }

    /// Optional change notifications. Sources without one are polled only.
    fn changes(&self) -> Option<watch::Receiver<()>> {
        None
    }
}

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySourceKind {
    Profile,
    User,
    Credential,
}

impl std::fmt::Display for IdentitySourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentitySourceKind::Profile => write!(f, "profile"),
            IdentitySourceKind::User => write!(f, "user"),
            IdentitySourceKind::Credential => write!(f, "credential"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub id: String,
    pub source: IdentitySourceKind,
}

/// A transition of the effective identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityChange {
    pub previous: Option<String>,
    pub current: Option<ResolvedIdentity>,
}

impl IdentityChange {
    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.id.as_str())
    }
}

pub struct IdentityResolver {
    session: Arc<dyn SessionSource>,
    credentials: CredentialReader,
    /// Last identity seen by `poll`. Kept out of any published state.
    last_known: Mutex<Option<String>>,
}

impl IdentityResolver {
    pub fn new(session: Arc<dyn SessionSource>, credentials: CredentialReader) -> Self {
        Self {
            session,
            credentials,
            last_known: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<dyn SessionSource> {
        &self.session
    }

    pub fn credentials(&self) -> &CredentialReader {
        &self.credentials
    }

    /// Compute the effective identity without touching the last-known cell.
    pub async fn resolve(&self) -> Option<ResolvedIdentity> {
        if let Some(id) = non_blank(self.session.profile_id()) {
            return Some(ResolvedIdentity { id, source: IdentitySourceKind::Profile });
        }
        if let Some(id) = non_blank(self.session.user_id()) {
            return Some(ResolvedIdentity { id, source: IdentitySourceKind::User });
        }
        self.credentials
            .read_subject()
            .await
            .map(|id| ResolvedIdentity { id, source: IdentitySourceKind::Credential })
    }

    /// Resolve and compare against the last-known identity.
    ///
    /// Returns the change if the identity differs, after recording it. A
    /// credential-derived identity also kicks off a background profile load.
    pub async fn poll(&self) -> Option<IdentityChange> {
        let resolved = self.resolve().await;
        let change = {
            let mut last = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
            let current_id = resolved.as_ref().map(|r| r.id.clone());
            if *last == current_id {
                return None;
            }
            let previous = std::mem::replace(&mut *last, current_id);
            IdentityChange { previous, current: resolved }
        };

        match &change.current {
            Some(r) => tracing::info!("Identity changed to {} (from {})", r.id, r.source),
            None => tracing::info!("Identity cleared"),
        }

        if let Some(ResolvedIdentity { id, source: IdentitySourceKind::Credential }) = &change.current {
            self.request_profile(id.clone());
        }

        Some(change)
    }

    /// Last identity recorded by `poll`.
    pub fn last_known(&self) -> Option<String> {
        self.last_known.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Forget the last-known identity so the next `poll` reports a change.
    pub fn reset(&self) -> Option<String> {
        self.last_known.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn request_profile(&self, identity: String) {
        let session = self.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.load_profile(&identity).await {
                tracing::warn!("Profile load for {} failed: {}", identity, e);
            }
        });
    }
}

fn non_blank(id: Option<String>) -> Option<String> {
    id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// In-process session: profile and user ids set directly by the host.
pub struct SessionState {
    ids: RwLock<SessionIds>,
    profile_requests: Mutex<Vec<String>>,
    notify: watch::Sender<()>,
}

#[derive(Default)]
struct SessionIds {
    profile_id: Option<String>,
    user_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        let (notify, _) = watch::channel(());
        Self {
            ids: RwLock::new(SessionIds::default()),
            profile_requests: Mutex::new(Vec::new()),
            notify,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(profile_id: Option<String>, user_id: Option<String>) -> Self {
        let state = Self::default();
        {
            let mut ids = state.write_ids();
            ids.profile_id = profile_id;
            ids.user_id = user_id;
        }
        state
    }

    pub fn set_profile_id(&self, id: Option<String>) {
        self.write_ids().profile_id = id;
        self.notify.send_replace(());
    }

    pub fn set_user_id(&self, id: Option<String>) {
        self.write_ids().user_id = id;
        self.notify.send_replace(());
    }

    /// Drop both ids, as on logout.
    pub fn sign_out(&self) {
        *self.write_ids() = SessionIds::default();
        self.notify.send_replace(());
    }

    fn read_ids(&self) -> RwLockReadGuard<'_, SessionIds> {
        self.ids.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_ids(&self) -> RwLockWriteGuard<'_, SessionIds> {
        self.ids.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Identities a profile load was requested for, oldest first.
    pub fn profile_requests(&self) -> Vec<String> {
        self.profile_requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionSource for SessionState {
    fn profile_id(&self) -> Option<String> {
        self.read_ids().profile_id.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.read_ids().user_id.clone()
    }

    async fn load_profile(&self, identity: &str) -> Result<()> {
        tracing::debug!("Profile load requested for {}", identity);
        self.profile_requests
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?
            .push(identity.to_string());
        Ok(())
    }

    fn changes(&self) -> Option<watch::Receiver<()>> {
        Some(self.notify.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::make_token;
    use crate::storage::{KvStorage, MemoryStorage};
    use serde_json::json;

    async fn resolver_with(
        profile: Option<&str>,
        user: Option<&str>,
        subject: Option<&str>,
    ) -> (Arc<SessionState>, Arc<MemoryStorage>, IdentityResolver) {
        let session = Arc::new(SessionState::with_ids(
            profile.map(String::from),
            user.map(String::from),
        ));
        let storage = Arc::new(MemoryStorage::new());
        if let Some(sub) = subject {
            storage.set("token", &make_token(&json!({ "id": sub }))).await.unwrap();
        }
        let resolver = IdentityResolver::new(session.clone(), CredentialReader::new(storage.clone(), "token"));
        (session, storage, resolver)
    }

    #[tokio::test]
    async fn test_priority_profile_user_credential() {
        let (_s, _st, r) = resolver_with(Some("p"), Some("u"), Some("c")).await;
        assert_eq!(r.resolve().await.unwrap(), ResolvedIdentity { id: "p".into(), source: IdentitySourceKind::Profile });

        let (_s, _st, r) = resolver_with(None, Some("u"), Some("c")).await;
        assert_eq!(r.resolve().await.unwrap(), ResolvedIdentity { id: "u".into(), source: IdentitySourceKind::User });

        let (_s, _st, r) = resolver_with(None, None, Some("c")).await;
        assert_eq!(r.resolve().await.unwrap(), ResolvedIdentity { id: "c".into(), source: IdentitySourceKind::Credential });

        let (_s, _st, r) = resolver_with(None, None, None).await;
        assert!(r.resolve().await.is_none());
    }

    #[tokio::test]
    async fn test_blank_ids_fall_through() {
        let (_s, _st, r) = resolver_with(Some("  "), Some(""), Some("c")).await;
        assert_eq!(r.resolve().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn test_poll_reports_only_changes() {
        let (session, _st, r) = resolver_with(None, Some("u1"), None).await;

        let change = r.poll().await.unwrap();
        assert_eq!(change.previous, None);
        assert_eq!(change.current_id(), Some("u1"));
        assert!(r.poll().await.is_none());

        session.set_user_id(Some("u2".into()));
        let change = r.poll().await.unwrap();
        assert_eq!(change.previous.as_deref(), Some("u1"));
        assert_eq!(change.current_id(), Some("u2"));
        assert_eq!(r.last_known().as_deref(), Some("u2"));

        session.sign_out();
        let change = r.poll().await.unwrap();
        assert_eq!(change.current, None);
        assert!(r.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_same_id_from_different_source_is_not_a_change() {
        let (session, _st, r) = resolver_with(None, None, Some("u1")).await;
        assert!(r.poll().await.is_some());
        session.set_profile_id(Some("u1".into()));
        assert!(r.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_makes_next_poll_fresh() {
        let (_s, _st, r) = resolver_with(Some("p1"), None, None).await;
        assert!(r.poll().await.is_some());
        assert_eq!(r.reset().as_deref(), Some("p1"));
        assert!(r.last_known().is_none());
        assert_eq!(r.poll().await.unwrap().current_id(), Some("p1"));
    }

    #[tokio::test]
    async fn test_credential_identity_requests_profile() {
        let (session, _st, r) = resolver_with(None, None, Some("c1")).await;
        r.poll().await.unwrap();
        // The request runs on a spawned task
        for _ in 0..50 {
            if !session.profile_requests().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.profile_requests(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_profile_identity_does_not_request_profile() {
        let (session, _st, r) = resolver_with(Some("p1"), None, Some("c1")).await;
        r.poll().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(session.profile_requests().is_empty());
    }

    #[tokio::test]
    async fn test_session_changes_notify() {
        let session = SessionState::new();
        let mut rx = session.changes().unwrap();
        session.set_profile_id(Some("p".into()));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_session_ids_survive_poisoned_lock() {
        let session = Arc::new(SessionState::with_ids(None, Some("u0".into())));
        let poisoner = session.clone();
        let _ = std::thread::spawn(move || {
            let _ids = poisoner.write_ids();
            panic!("poison the session lock");
        })
        .join();
        assert!(session.ids.is_poisoned());

        assert_eq!(session.user_id().as_deref(), Some("u0"));
        session.set_user_id(Some("u1".into()));
        session.set_profile_id(Some("p1".into()));
        assert_eq!(session.user_id().as_deref(), Some("u1"));
        assert_eq!(session.profile_id().as_deref(), Some("p1"));

        session.sign_out();
        assert!(session.user_id().is_none());
        assert!(session.profile_id().is_none());
    }
}
