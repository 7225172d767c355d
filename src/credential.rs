//! Bearer credential access.
//!
//! The credential is read from storage and its payload decoded *without*
//! signature verification. The subject it yields only namespaces the local
//! favorites cache; the backend remains the sole authority on who the
//! caller is.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;

use crate::favorite::id_from_value;
use crate::storage::KvStorage;

/// Claim names checked for the subject, in order.
const SUBJECT_CLAIMS: [&str; 5] = ["id", "sub", "subject", "_id", "userId"];

#[derive(Clone)]
pub struct CredentialReader {
    storage: Arc<dyn KvStorage>,
    key: String,
}

impl CredentialReader {
    pub fn new(storage: Arc<dyn KvStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// Storage key the credential lives under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw credential, or None if nothing (or only whitespace) is stored.
    /// Storage errors are logged and read as "no credential".
    pub async fn read_credential(&self) -> Option<String> {
        match self.storage.get(&self.key).await {
            Ok(Some(raw)) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Could not read credential: {}", e);
                None
            }
        }
    }

    /// Subject of the stored credential, if one is stored and decodes.
    pub async fn read_subject(&self) -> Option<String> {
        let credential = self.read_credential().await?;
        decode_subject(&credential)
    }

    pub async fn store_credential(&self, credential: &str) -> anyhow::Result<()> {
        self.storage.set(&self.key, credential.trim()).await
    }

    pub async fn remove_credential(&self) -> anyhow::Result<()> {
        self.storage.remove(&self.key).await
    }
}

/// Extract the subject from a three-segment bearer credential.
///
/// Any malformation (segment count, base64, JSON, missing claim) yields None.
pub fn decode_subject(credential: &str) -> Option<String> {
    let credential = credential.trim();
    let credential = credential.strip_prefix("Bearer ").unwrap_or(credential);

    let segments: Vec<&str> = credential.split('.').collect();
    if segments.len() != 3 {
        tracing::debug!("Credential has {} segments, expected 3", segments.len());
        return None;
    }

    let payload = pad_base64(segments[1]);
    let decoded = match general_purpose::URL_SAFE.decode(payload.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Credential payload is not base64url: {}", e);
            return None;
        }
    };

    let claims: Value = match serde_json::from_slice(&decoded) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Credential payload is not JSON: {}", e);
            return None;
        }
    };

    let subject = SUBJECT_CLAIMS
        .iter()
        .find_map(|claim| claims.get(*claim).and_then(id_from_value));
    if subject.is_none() {
        tracing::debug!("Credential payload carries no subject claim");
    }
    subject
}

/// Pad a base64url segment with `=` to a multiple of 4 characters.
fn pad_base64(segment: &str) -> String {
    let mut padded = segment.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    padded
}

#[cfg(test)]
pub(crate) fn make_token(claims: &Value) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
