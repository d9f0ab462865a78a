//! In-memory cache of decrypted system and intermediate keys.

use crate::types::KeyMeta;
use asherah_crypto::CryptoKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// A decrypted key and when it was last confirmed against the metastore.
#[derive(Debug, Clone)]
pub(crate) struct CachedKey {
    pub key: Arc<CryptoKey>,
    pub loaded_at: i64,
    /// The key this one is encrypted under (IKs only).
    pub parent: Option<KeyMeta>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<KeyMeta, CachedKey>,
    /// Newest known version per key id.
    latest: HashMap<String, KeyMeta>,
}

/// Keys addressed by `(id, created)`, plus a pointer to the latest version of
/// each id. Key bytes are wiped when the last `Arc` to them drops.
///
/// A disabled cache stores nothing, so every lookup goes to the metastore.
#[derive(Debug)]
pub(crate) struct KeyCache {
    enabled: bool,
    state: RwLock<CacheState>,
}

impl KeyCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn get(&self, meta: &KeyMeta) -> Option<CachedKey> {
        if !self.enabled {
            return None;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(meta).cloned()
    }

    pub fn get_latest(&self, id: &str) -> Option<(KeyMeta, CachedKey)> {
        if !self.enabled {
            return None;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let meta = state.latest.get(id)?;
        let cached = state.entries.get(meta)?;
        Some((meta.clone(), cached.clone()))
    }

    /// Caches `key`. With `latest` set it also becomes the current version of
    /// its id, unless a newer version is already known.
    pub fn insert(
        &self,
        meta: KeyMeta,
        key: Arc<CryptoKey>,
        loaded_at: i64,
        parent: Option<KeyMeta>,
        latest: bool,
    ) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if latest {
            let newer_known = state
                .latest
                .get(&meta.id)
                .is_some_and(|current| current.created > meta.created);
            if !newer_known {
                state.latest.insert(meta.id.clone(), meta.clone());
            }
        }
        state.entries.insert(
            meta,
            CachedKey {
                key,
                loaded_at,
                parent,
            },
        );
    }

    /// Flags a cached key as revoked. Returns whether it was cached.
    pub fn mark_revoked(&self, meta: &KeyMeta) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get(meta) {
            Some(cached) => {
                cached.key.mark_revoked();
                true
            }
            None => false,
        }
    }

    /// Drops every entry. Keys not borrowed elsewhere are wiped immediately.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = state.entries.len();
        state.entries.clear();
        state.latest.clear();
        if dropped > 0 {
            debug!("cleared {dropped} cached keys");
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.len()
    }
}
