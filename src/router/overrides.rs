//! Saved client-model overrides.
//!
//! An override pins a client model name (or `*`) to a provider model,
//! ahead of rules and the classifier. The store keeps explicit insertion
//! order, caps its size (updates to existing entries always succeed, new
//! entries past the cap are rejected), and persists through an atomic
//! temp-file-plus-rename write. A missing file at load time is not an
//! error.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideEntry {
    pub key: String,
    pub model: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("override capacity reached ({cap}); remove an entry first")]
    CapacityReached { cap: usize },
}

#[derive(Debug, Default)]
pub struct OverrideStore {
    entries: Mutex<Vec<OverrideEntry>>,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OverrideEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or update. Updates never fail; inserts respect `cap`.
    pub fn set(&self, key: &str, model: &str, cap: usize) -> Result<(), OverrideError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.key == key) {
            existing.model = model.to_string();
            return Ok(());
        }
        if entries.len() >= cap {
            return Err(OverrideError::CapacityReached { cap });
        }
        entries.push(OverrideEntry { key: key.to_string(), model: model.to_string() });
        Ok(())
    }

    /// Exact key first, then the `*` wildcard.
    pub fn resolve(&self, client_model: Option<&str>) -> Option<String> {
        let entries = self.lock();
        if let Some(model) = client_model {
            if let Some(hit) = entries.iter().find(|e| e.key == model) {
                return Some(hit.model.clone());
            }
        }
        entries.iter().find(|e| e.key == "*").map(|e| e.model.clone())
    }

    pub fn clear(&self, key: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.key != key);
        entries.len() != before
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn list(&self) -> Vec<OverrideEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace contents wholesale (runtime config edits).
    pub fn replace(&self, entries: Vec<OverrideEntry>, cap: usize) {
        let mut guard = self.lock();
        *guard = entries;
        guard.truncate(cap);
    }

    /// Atomic write: serialize to a sibling temp file, then rename over.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let entries = self.list();
        let json = serde_json::to_vec_pretty(&entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), count = entries.len(), "overrides persisted");
        Ok(())
    }

    /// Best-effort load; a missing or unreadable file leaves the store empty.
    pub fn load(&self, path: &Path, cap: usize) {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<OverrideEntry>>(&bytes) {
                Ok(entries) => {
                    let count = entries.len();
                    self.replace(entries, cap);
                    tracing::info!(path = %path.display(), count, "overrides loaded");
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "overrides file unreadable, ignored");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "overrides file unreadable, ignored");
            }
        }
    }
}
