//! Identity-scoped favorites for the lodging and meal-service marketplace.
//!
//! A [`FavoritesService`] holds one favorites set for whoever is logged in,
//! mirrors it to local storage, and reconciles it with the backend each
//! time the effective identity changes. A [`ConsistencyLoop`] keeps it
//! tracking logins and logouts that happen outside its call paths.

pub mod config;
pub mod consistency;
pub mod credential;
pub mod favorite;
pub mod identity;
pub mod local;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod storage;

pub use config::Config;
pub use consistency::{ConsistencyHandle, ConsistencyLoop};
pub use favorite::{Category, FavoriteItem, FavoriteKey};
pub use identity::{IdentitySourceKind, SessionSource, SessionState};
pub use service::FavoritesService;
