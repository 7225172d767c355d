//! Background consistency loop.
//!
//! Two periodic tasks run for the lifetime of the returned handle:
//!
//! - identity task: re-resolves the identity every `identity_interval`,
//!   and immediately on a session change notification when the session
//!   source offers one
//! - logout task: every `logout_interval`, clears favorites if the
//!   credential has gone while an identity is still resolved
//!
//! Both are idempotent; a redundant tick leaves the state unchanged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::identity::SessionSource;
use crate::service::FavoritesService;

pub struct ConsistencyLoop;

impl ConsistencyLoop {
    pub fn spawn(service: Arc<FavoritesService>, config: &SyncConfig) -> ConsistencyHandle {
        Self::spawn_with(service, config.identity_interval(), config.logout_interval())
    }

    pub fn spawn_with(
        service: Arc<FavoritesService>,
        identity_interval: Duration,
        logout_interval: Duration,
    ) -> ConsistencyHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let changes = service.resolver().session().changes();

        let identity_task = tokio::spawn(run_identity_task(
            service.clone(),
            identity_interval,
            changes,
            shutdown_rx.clone(),
        ));
        let logout_task = tokio::spawn(run_logout_task(service, logout_interval, shutdown_rx));

        tracing::debug!(
            "Consistency loop started (identity every {:?}, logout check every {:?})",
            identity_interval,
            logout_interval
        );

        ConsistencyHandle {
            shutdown: shutdown_tx,
            tasks: vec![identity_task, logout_task],
        }
    }
}

/// Running loop. Dropping it stops both tasks.
pub struct ConsistencyHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsistencyHandle {
    /// Stop both tasks and wait for them to finish their current step.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Consistency task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ConsistencyHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_identity_task(
    service: Arc<FavoritesService>,
    period: Duration,
    mut changes: Option<watch::Receiver<()>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            changed = next_change(&mut changes) => {
                if changed.is_err() {
                    // Source dropped its sender; keep polling on the timer
                    changes = None;
                    continue;
                }
            }
        }
        service.resolve().await;
    }
}

async fn run_logout_task(
    service: Arc<FavoritesService>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        service.detect_logout().await;
    }
}

async fn next_change(
    changes: &mut Option<watch::Receiver<()>>,
) -> Result<(), watch::error::RecvError> {
    match changes {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::make_token;
    use crate::favorite::{Category, FavoriteItem};
    use crate::identity::SessionState;
    use crate::remote::testing::StaticRemote;
    use crate::storage::{KvStorage, MemoryStorage};
    use serde_json::{json, Value};

    /// Session with no change notifications, so only the timers drive it.
    struct PolledSession(SessionState);

    #[async_trait::async_trait]
    impl SessionSource for PolledSession {
        fn profile_id(&self) -> Option<String> {
            self.0.profile_id()
        }

        fn user_id(&self) -> Option<String> {
            self.0.user_id()
        }
    }

    fn service_with(
        session: Arc<dyn SessionSource>,
    ) -> (Arc<MemoryStorage>, Arc<StaticRemote>, Arc<FavoritesService>) {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(StaticRemote::new());
        let service = Arc::new(FavoritesService::with_storage(
            storage.clone(),
            "token",
            session,
            remote.clone(),
        ));
        (storage, remote, service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_timer_catches_login() {
        let session = Arc::new(PolledSession(SessionState::new()));
        let (storage, remote, service) = service_with(session.clone());
        remote.set("u1", Category::Lodging, vec![FavoriteItem::new("h1", Category::Lodging, Value::Null)]);

        let handle = ConsistencyLoop::spawn_with(service.clone(), Duration::from_secs(5), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(service.current_identity().is_none());

        storage.set("token", &make_token(&json!({"id": "u1"}))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(service.current_identity().as_deref(), Some("u1"));
        assert!(service.is_favorite("h1", Category::Lodging));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_timer_clears() {
        // The user id outlives the credential, so the identity stays resolved
        let session = Arc::new(PolledSession(SessionState::with_ids(None, Some("u1".into()))));
        let (storage, _remote, service) = service_with(session);
        storage.set("token", &make_token(&json!({"id": "u1"}))).await.unwrap();

        let handle = ConsistencyLoop::spawn_with(service.clone(), Duration::from_secs(7), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        service.add(FavoriteItem::new("h1", Category::Lodging, Value::Null)).await;
        assert!(storage.get("favorites_u1").await.unwrap().is_some());

        storage.remove("token").await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(service.is_favorite("h1", Category::Lodging));

        // Logout check fires at t=30, next identity tick not before t=35
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(service.favorites().is_empty());
        assert!(service.current_identity().is_none());
        assert!(storage.get("favorites_u1").await.unwrap().is_none());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_notification_resolves_before_tick() {
        let session = Arc::new(SessionState::new());
        let (_storage, _remote, service) = service_with(session.clone());

        let handle = ConsistencyLoop::spawn_with(service.clone(), Duration::from_secs(3600), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.current_identity().is_none());

        session.set_profile_id(Some("p1".into()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.current_identity().as_deref(), Some("p1"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_resolving() {
        let session = Arc::new(PolledSession(SessionState::new()));
        let (storage, _remote, service) = service_with(session);

        let handle = ConsistencyLoop::spawn_with(service.clone(), Duration::from_secs(5), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(handle);

        storage.set("token", &make_token(&json!({"id": "u1"}))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(service.current_identity().is_none());
    }
}
