//! Backend favorites endpoints.
//!
//! `GET {base}/favorites/lodging` and `GET {base}/favorites/meal-service`,
//! both answering `{ "success": bool, "data": [Listing] }`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client as HttpClient};
use serde_json::Value;

use crate::credential::CredentialReader;
use crate::favorite::{listing_id, Category, FavoriteItem};

/// Source of the server's favorites for an identity.
#[async_trait]
pub trait RemoteFavorites: Send + Sync {
    /// Favorites stored remotely for `identity` in `category`.
    ///
    /// Implementations should degrade to an empty list on failure; callers
    /// also treat `Err` as empty.
    async fn fetch(&self, identity: &str, category: Category) -> Result<Vec<FavoriteItem>>;
}

pub struct HttpFavoritesClient {
    base_url: String,
    credentials: CredentialReader,
    http_client: HttpClient,
}

impl HttpFavoritesClient {
    pub fn new(base_url: &str, credentials: CredentialReader, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            http_client: builder.build()?,
        })
    }

    pub fn endpoint(&self, category: Category) -> String {
        format!("{}/favorites/{}", self.base_url, category.endpoint_segment())
    }
}

#[async_trait]
impl RemoteFavorites for HttpFavoritesClient {
    async fn fetch(&self, identity: &str, category: Category) -> Result<Vec<FavoriteItem>> {
        let Some(token) = self.credentials.read_credential().await else {
            tracing::debug!("No credential stored, skipping remote {} favorites", category);
            return Ok(vec![]);
        };

        let url = self.endpoint(category);
        let response = self.http_client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let json: Value = match resp.json().await {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Malformed {} favorites body for {}: {}", category, identity, e);
                        return Ok(vec![]);
                    }
                };

                match parse_favorites_response(category, &json) {
                    Some(items) => {
                        tracing::debug!("Fetched {} remote {} favorites for {}", items.len(), category, identity);
                        Ok(items)
                    }
                    None => {
                        tracing::warn!("Unexpected {} favorites response shape for {}", category, identity);
                        Ok(vec![])
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!("Favorites request {} failed: {}", url, resp.status());
                Ok(vec![])
            }
            Err(e) => {
                tracing::warn!("Network error fetching {} favorites: {}", category, e);
                Ok(vec![])
            }
        }
    }
}

/// Normalize a `{ success, data }` body into favorites of `category`.
///
/// Returns None unless `success` is true and `data` is an array. Listings
/// without a usable identifier are skipped.
pub fn parse_favorites_response(category: Category, json: &Value) -> Option<Vec<FavoriteItem>> {
    if json.get("success").and_then(|s| s.as_bool()) != Some(true) {
        return None;
    }
    let data = json.get("data")?.as_array()?;

    let items = data
        .iter()
        .filter_map(|listing| {
            let id = listing_id(category, listing)?;
            Some(FavoriteItem::new(id, category, listing.clone()))
        })
        .collect();
    Some(items)
}
