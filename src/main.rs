//! favsync: inspect and drive the favorites cache from a terminal.
//!
//! Reads `config.toml` (or the path given with `--config`), opens the local
//! redb store, and talks to the configured backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use favsync::credential::CredentialReader;
use favsync::remote::HttpFavoritesClient;
use favsync::storage::{KvStorage, RedbStorage};
use favsync::{Category, Config, ConsistencyLoop, FavoriteItem, FavoritesService, SessionState};

#[derive(Parser)]
#[command(author, version, about = "Identity-scoped favorites cache")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profile id reported by the session.
    #[arg(long, global = true)]
    profile_id: Option<String>,

    /// User id reported by the session.
    #[arg(long, global = true)]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a bearer credential.
    Login { token: String },
    /// Remove the stored credential and clear cached favorites.
    Logout,
    /// Show the effective identity and where it came from.
    Whoami,
    /// List favorites for the current identity.
    List {
        #[arg(long)]
        category: Option<Category>,
    },
    /// Add or remove a favorite.
    Toggle {
        category: Category,
        id: String,
        /// Listing snapshot stored with a new favorite (JSON).
        #[arg(long)]
        payload: Option<String>,
    },
    /// Remove a favorite.
    Remove { category: Category, id: String },
    /// Re-run reconciliation against the backend.
    Refresh,
    /// Drop cached favorites for the current session.
    Clear,
    /// Run the background consistency loop until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db_path = config.db_path()?;
    let storage: Arc<dyn KvStorage> = Arc::new(
        RedbStorage::open(&db_path)
            .with_context(|| format!("opening {}", db_path.display()))?,
    );
    tracing::debug!("Using {} storage at {}", storage.backend_name(), db_path.display());

    let credentials = CredentialReader::new(storage.clone(), config.storage.credential_key.clone());
    let remote = Arc::new(HttpFavoritesClient::new(
        &config.backend.base_url,
        credentials,
        config.backend.request_timeout(),
    )?);
    let session = Arc::new(SessionState::with_ids(cli.profile_id.clone(), cli.user_id.clone()));
    let service = Arc::new(FavoritesService::with_storage(
        storage,
        &config.storage.credential_key,
        session,
        remote,
    ));

    match cli.command {
        Command::Login { token } => {
            service.credentials().store_credential(&token).await?;
            service.resolve().await;
            match service.resolver().resolve().await {
                Some(identity) => println!("Logged in as {} ({})", identity.id, identity.source),
                None => println!("Credential stored, but no identity could be derived from it"),
            }
        }
        Command::Logout => {
            service.resolve().await;
            service.credentials().remove_credential().await?;
            if !service.detect_logout().await {
                service.clear().await;
            }
            println!("Logged out");
        }
        Command::Whoami => match service.resolver().resolve().await {
            Some(identity) => println!("{} (from {})", identity.id, identity.source),
            None => println!("Not logged in"),
        },
        Command::List { category } => {
            service.resolve().await;
            let items = match category {
                Some(category) => service.favorites_in(category),
                None => service.favorites(),
            };
            print_favorites(&items);
        }
        Command::Toggle { category, id, payload } => {
            service.resolve().await;
            let snapshot = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload is not valid JSON")?,
                None => Value::Null,
            };
            if service.toggle(&id, category, snapshot).await {
                println!("Added {} {}", category, id);
            } else {
                println!("Removed {} {}", category, id);
            }
        }
        Command::Remove { category, id } => {
            service.resolve().await;
            if service.remove(&id, category).await {
                println!("Removed {} {}", category, id);
            } else {
                println!("{} {} was not a favorite", category, id);
            }
        }
        Command::Refresh => {
            service.refresh().await;
            print_favorites(&service.favorites());
        }
        Command::Clear => {
            service.resolve().await;
            service.clear().await;
            println!("Favorites cleared");
        }
        Command::Watch => watch(service, &config).await?,
    }

    Ok(())
}

async fn watch(service: Arc<FavoritesService>, config: &Config) -> Result<()> {
    let handle = ConsistencyLoop::spawn(service.clone(), &config.sync);
    let mut updates = service.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let items = updates.borrow_and_update().clone();
                let identity = service.current_identity().unwrap_or_else(|| "-".to_string());
                println!("[{}] {} favorites", identity, items.len());
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn print_favorites(items: &[FavoriteItem]) {
    if items.is_empty() {
        println!("No favorites");
        return;
    }
    for item in items {
        let name = item
            .payload
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("");
        println!("{:<13} {:<26} {}", item.category.to_string(), item.id, name);
    }
}
