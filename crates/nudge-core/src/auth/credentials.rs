use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted token pair. `saved_at` records the last write for diagnostics;
/// expiry is never computed from it - the gateway refreshes in reaction to
/// 401 responses only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    access: String,
    refresh: String,
    saved_at: DateTime<Utc>,
}

/// Durable store for the access/refresh token pair.
///
/// The pair is held in memory behind a mutex so any number of concurrent
/// gateway calls can read it synchronously, and mirrored to a JSON file at
/// the given path so the session survives restarts. Both tokens are always
/// written and cleared together: the store never rests with one half of a
/// session.
pub struct CredentialStore {
    path: PathBuf,
    tokens: Mutex<Option<StoredTokens>>,
}

impl CredentialStore {
    /// Open a store backed by the given file, loading any persisted session.
    pub fn open(path: PathBuf) -> Result<Self> {
        let tokens = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read token file: {}", path.display()))?;
            let stored: StoredTokens = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse token file: {}", path.display()))?;
            Some(stored)
        } else {
            None
        };

        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }

    /// Get the current access token, if a session is active.
    pub fn access_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.access.clone())
    }

    /// Get the current refresh token, if a session is active.
    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.refresh.clone())
    }

    /// Check whether a session might be active (an access token is stored).
    pub fn has_session(&self) -> bool {
        self.tokens.lock().is_some()
    }

    /// Store a full token pair (login or re-issued grant).
    pub fn store(&self, access: &str, refresh: &str) -> Result<()> {
        let mut tokens = self.tokens.lock();
        *tokens = Some(StoredTokens {
            access: access.to_string(),
            refresh: refresh.to_string(),
            saved_at: Utc::now(),
        });
        self.persist(tokens.as_ref())
    }

    /// Overwrite the access token only, leaving the refresh token untouched.
    pub fn store_access(&self, access: &str) -> Result<()> {
        let mut tokens = self.tokens.lock();
        let Some(current) = tokens.as_mut() else {
            // A logout raced the refresh; do not resurrect the cleared session.
            debug!("store_access on empty store, ignoring");
            return Ok(());
        };
        current.access = access.to_string();
        current.saved_at = Utc::now();
        self.persist(tokens.as_ref())
    }

    /// Clear both tokens and delete the backing file.
    /// Idempotent: safe to call when already empty.
    pub fn clear(&self) -> Result<()> {
        let mut tokens = self.tokens.lock();
        *tokens = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete token file: {}", self.path.display()))?;
        }
        Ok(())
    }

    fn persist(&self, tokens: Option<&StoredTokens>) -> Result<()> {
        let Some(tokens) = tokens else { return Ok(()) };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write token file: {}", self.path.display()))?;
        Ok(())
    }
}
