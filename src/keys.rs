//! Bearer credential pool.
//!
//! The store owns the key list behind an `ArcSwap` so a reload swaps the
//! whole list atomically while in-flight requests keep their snapshot.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// One bearer credential. The index is the stable external identifier used
/// by control endpoints and events; the secret never leaves this module
/// except through [`Key::bearer`].
pub struct Key {
    pub index: usize,
    pub id: String,
    secret: String,
}

impl Key {
    pub fn new(index: usize, secret: impl Into<String>) -> Self {
        Self { index, id: format!("key-{index}"), secret: secret.into() }
    }

    pub fn bearer(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs.
        f.debug_struct("Key").field("index", &self.index).field("id", &self.id).finish()
    }
}

/// Read-mostly credential store with atomic reload.
#[derive(Debug)]
pub struct KeyStore {
    keys: ArcSwap<Vec<Arc<Key>>>,
}

impl KeyStore {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        Self { keys: ArcSwap::from_pointee(Self::build(secrets)) }
    }

    fn build(secrets: impl IntoIterator<Item = String>) -> Vec<Arc<Key>> {
        secrets.into_iter().enumerate().map(|(i, s)| Arc::new(Key::new(i, s))).collect()
    }

    /// Snapshot of the current list; stable for the caller's lifetime.
    pub fn list(&self) -> Arc<Vec<Arc<Key>>> {
        self.keys.load_full()
    }

    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.load().is_empty()
    }

    /// Replace the key list. Indices restart from zero; per-key runtime
    /// state is rebuilt by the scheduler on its next reload notification.
    pub fn reload(&self, secrets: impl IntoIterator<Item = String>) -> usize {
        let next = Self::build(secrets);
        let count = next.len();
        self.keys.store(Arc::new(next));
        tracing::info!(count, "key store reloaded");
        count
    }
}
