//! The SK/IK key hierarchy.
//!
//! Both levels follow the same lifecycle: use the cached latest version while
//! it is valid, otherwise load the latest version from the metastore, and
//! create a new one when that is missing, expired, or revoked. Creation is
//! serialized per level with a mutex and double-checked against the cache, so
//! one process creates at most one key per id and timestamp. Losing a
//! cross-process race (`AlreadyExists`) is recovered by loading the winner.
//!
//! Expired keys stay usable for decryption; revoked keys do not.

use crate::clock::Clock;
use crate::error::{AsherahError, AsherahResult};
use crate::key_cache::{CachedKey, KeyCache};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::partition::Partition;
use crate::policy::CryptoPolicy;
use crate::types::{EnvelopeKeyRecord, KeyMeta};
use asherah_crypto::CryptoKey;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// A resolved key together with the metadata naming it.
pub(crate) type ResolvedKey = (KeyMeta, Arc<CryptoKey>);

fn revoked(meta: &KeyMeta) -> AsherahError {
    AsherahError::KeyRevoked {
        id: meta.id.clone(),
        created: meta.created,
    }
}

fn not_found(meta: &KeyMeta) -> AsherahError {
    AsherahError::KeyNotFound {
        id: meta.id.clone(),
        created: meta.created,
    }
}

/// Timestamp for a replacement key: never at or before the version it replaces.
fn replacement_timestamp(policy: &CryptoPolicy, now: i64, replaces: Option<i64>) -> i64 {
    let created = policy.new_key_timestamp(now);
    match replaces {
        Some(previous) if created <= previous => previous + 1,
        _ => created,
    }
}

/// System keys for one service/product, shared by every partition.
#[derive(Debug)]
pub(crate) struct SystemKeyManager {
    key_id: String,
    policy: Arc<CryptoPolicy>,
    kms: Arc<dyn KeyManagementService>,
    metastore: Arc<dyn Metastore>,
    clock: Arc<dyn Clock>,
    cache: KeyCache,
    create_lock: Mutex<()>,
}

impl SystemKeyManager {
    pub fn new(
        key_id: String,
        policy: Arc<CryptoPolicy>,
        kms: Arc<dyn KeyManagementService>,
        metastore: Arc<dyn Metastore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = KeyCache::new(policy.cache_system_keys);
        Self {
            key_id,
            policy,
            kms,
            metastore,
            clock,
            cache,
            create_lock: Mutex::new(()),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn policy(&self) -> &CryptoPolicy {
        &self.policy
    }

    pub fn metastore(&self) -> &dyn Metastore {
        self.metastore.as_ref()
    }

    pub fn now(&self) -> i64 {
        self.clock.now_unix()
    }

    fn usable_for_encrypt(&self, cached: &CachedKey, meta: &KeyMeta, now: i64) -> bool {
        !cached.key.is_revoked()
            && !self.policy.is_key_expired(meta.created, now)
            && !self.policy.needs_recheck(cached.loaded_at, now)
    }

    /// Whether a cached SK is known to be revoked.
    pub fn is_cached_revoked(&self, meta: &KeyMeta) -> bool {
        self.cache
            .get(meta)
            .is_some_and(|cached| cached.key.is_revoked())
    }

    /// The SK to encrypt new IKs under, creating one if needed.
    pub fn current(&self) -> AsherahResult<ResolvedKey> {
        let now = self.now();
        if let Some(resolved) = self.cached_current(now) {
            return Ok(resolved);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(resolved) = self.cached_current(now) {
            return Ok(resolved);
        }

        let latest = self.metastore.load_latest(&self.key_id)?;
        let replaces = match latest {
            Some(record) => {
                let created = record.created;
                if let Some(resolved) = self.use_latest(record, now)? {
                    return Ok(resolved);
                }
                Some(created)
            }
            None => None,
        };
        self.create(now, replaces)
    }

    fn cached_current(&self, now: i64) -> Option<ResolvedKey> {
        let (meta, cached) = self.cache.get_latest(&self.key_id)?;
        if self.usable_for_encrypt(&cached, &meta, now) {
            debug!("system key cache hit for {}", meta.id);
            Some((meta, cached.key))
        } else {
            None
        }
    }

    /// Adopts the metastore's latest SK if it is still valid for encryption.
    fn use_latest(&self, record: EnvelopeKeyRecord, now: i64) -> AsherahResult<Option<ResolvedKey>> {
        let meta = KeyMeta::new(self.key_id.clone(), record.created);
        if record.is_revoked() {
            self.cache.mark_revoked(&meta);
            debug!("latest system key {} is revoked", meta.id);
            return Ok(None);
        }
        if self.policy.is_key_expired(record.created, now) {
            debug!("latest system key {} created {} is expired", meta.id, meta.created);
            return Ok(None);
        }
        let key = self.unwrap_record(&meta, &record)?;
        self.cache
            .insert(meta.clone(), Arc::clone(&key), now, None, true);
        Ok(Some((meta, key)))
    }

    /// Unwraps an unrevoked SK record, reusing the cached copy when the same
    /// version is already held so a recheck costs no KMS call.
    fn unwrap_record(&self, meta: &KeyMeta, record: &EnvelopeKeyRecord) -> AsherahResult<Arc<CryptoKey>> {
        if let Some(cached) = self.cache.get(meta) {
            if !cached.key.is_revoked() {
                debug!("system key {} unchanged at {}, keeping cached copy", meta.id, meta.created);
                return Ok(cached.key);
            }
        }
        self.decrypt_record(record)
    }

    fn decrypt_record(&self, record: &EnvelopeKeyRecord) -> AsherahResult<Arc<CryptoKey>> {
        let plain = self.kms.decrypt_key(&record.encrypted_key)?;
        let key = CryptoKey::from_slice(&plain, record.created, record.is_revoked())?;
        Ok(Arc::new(key))
    }

    fn create(&self, now: i64, replaces: Option<i64>) -> AsherahResult<ResolvedKey> {
        let created = replacement_timestamp(&self.policy, now, replaces);
        let key = CryptoKey::generate(created);
        let record = EnvelopeKeyRecord {
            revoked: None,
            created,
            encrypted_key: self.kms.encrypt_key(key.as_bytes())?,
            parent_key_meta: None,
        };

        let meta = KeyMeta::new(self.key_id.clone(), created);
        match self.metastore.store(&self.key_id, created, &record) {
            Ok(()) => {
                debug!("created system key {} at {created}", self.key_id);
                let key = Arc::new(key);
                self.cache
                    .insert(meta.clone(), Arc::clone(&key), now, None, true);
                Ok((meta, key))
            }
            Err(AsherahError::AlreadyExists { .. }) => {
                warn!(
                    "system key {} at {created} was created concurrently, loading winner",
                    self.key_id
                );
                drop(key);
                let winner = self
                    .metastore
                    .load_latest(&self.key_id)?
                    .ok_or_else(|| not_found(&meta))?;
                self.use_latest(winner, now)?.ok_or_else(|| not_found(&meta))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves a specific SK version for decryption.
    pub fn get(&self, meta: &KeyMeta) -> AsherahResult<Arc<CryptoKey>> {
        let now = self.now();
        if let Some(cached) = self.cache.get(meta) {
            if cached.key.is_revoked() {
                return Err(revoked(meta));
            }
            if !self.policy.needs_recheck(cached.loaded_at, now) {
                return Ok(cached.key);
            }
        }

        let record = self
            .metastore
            .load(&meta.id, meta.created)?
            .ok_or_else(|| not_found(meta))?;
        if record.is_revoked() {
            self.cache.mark_revoked(meta);
            return Err(revoked(meta));
        }

        let key = self.unwrap_record(meta, &record)?;
        let latest = self
            .cache
            .get_latest(&meta.id)
            .is_none_or(|(current, _)| current.created <= meta.created);
        self.cache
            .insert(meta.clone(), Arc::clone(&key), now, None, latest);
        Ok(key)
    }

    /// Revokes the latest SK version. Returns false when none exists.
    pub fn revoke_current(&self) -> AsherahResult<bool> {
        let Some(record) = self.metastore.load_latest(&self.key_id)? else {
            return Ok(false);
        };
        let meta = KeyMeta::new(self.key_id.clone(), record.created);
        let revoked = self.metastore.mark_revoked(&meta.id, meta.created)?;
        self.cache.mark_revoked(&meta);
        if revoked {
            warn!("revoked system key {} created {}", meta.id, meta.created);
        }
        Ok(revoked)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn close(&self) {
        self.cache.clear();
    }
}

/// Intermediate keys for one partition.
#[derive(Debug)]
pub(crate) struct KeyHierarchy {
    partition: Partition,
    system_keys: Arc<SystemKeyManager>,
    cache: KeyCache,
    create_lock: Mutex<()>,
}

impl KeyHierarchy {
    pub fn new(partition: Partition, system_keys: Arc<SystemKeyManager>) -> Self {
        let cache = KeyCache::new(system_keys.policy().cache_intermediate_keys);
        Self {
            partition,
            system_keys,
            cache,
            create_lock: Mutex::new(()),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn now(&self) -> i64 {
        self.system_keys.now()
    }

    /// The IK to encrypt new data row keys under, creating one if needed.
    pub fn current_intermediate_key(&self) -> AsherahResult<ResolvedKey> {
        let now = self.now();
        if let Some(resolved) = self.cached_current(now) {
            return Ok(resolved);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(resolved) = self.cached_current(now) {
            return Ok(resolved);
        }

        let ik_id = self.partition.intermediate_key_id();
        let latest = self.system_keys.metastore().load_latest(&ik_id)?;
        let replaces = match latest {
            Some(record) => {
                let created = record.created;
                if let Some(resolved) = self.use_latest(record, now)? {
                    return Ok(resolved);
                }
                Some(created)
            }
            None => None,
        };
        self.create(now, replaces)
    }

    fn cached_current(&self, now: i64) -> Option<ResolvedKey> {
        let ik_id = self.partition.intermediate_key_id();
        let (meta, cached) = self.cache.get_latest(&ik_id)?;
        let policy = self.system_keys.policy();
        if cached.key.is_revoked()
            || policy.is_key_expired(meta.created, now)
            || policy.needs_recheck(cached.loaded_at, now)
        {
            return None;
        }
        if let Some(parent) = &cached.parent {
            if self.system_keys.is_cached_revoked(parent) {
                return None;
            }
        }
        Some((meta, cached.key))
    }

    /// Adopts the metastore's latest IK if it and its SK are still valid for
    /// encryption.
    fn use_latest(&self, record: EnvelopeKeyRecord, now: i64) -> AsherahResult<Option<ResolvedKey>> {
        let meta = KeyMeta::new(self.partition.intermediate_key_id(), record.created);
        let policy = self.system_keys.policy();
        if record.is_revoked() {
            self.cache.mark_revoked(&meta);
            debug!("latest intermediate key {} is revoked", meta.id);
            return Ok(None);
        }
        if policy.is_key_expired(record.created, now) {
            debug!("latest intermediate key {} created {} is expired", meta.id, meta.created);
            return Ok(None);
        }
        let Some(parent) = record.parent_key_meta.clone() else {
            warn!("intermediate key {} has no parent key, replacing it", meta.id);
            return Ok(None);
        };
        if policy.is_key_expired(parent.created, now) {
            debug!("system key under {} is expired, rotating intermediate key", meta.id);
            return Ok(None);
        }

        let system_key = match self.system_keys.get(&parent) {
            Ok(key) => key,
            Err(AsherahError::KeyRevoked { .. }) => {
                debug!("system key under {} is revoked, rotating intermediate key", meta.id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let key = decrypt_child(&system_key, &record)?;
        self.cache
            .insert(meta.clone(), Arc::clone(&key), now, Some(parent), true);
        Ok(Some((meta, key)))
    }

    fn create(&self, now: i64, replaces: Option<i64>) -> AsherahResult<ResolvedKey> {
        let (sk_meta, system_key) = self.system_keys.current()?;
        let ik_id = self.partition.intermediate_key_id();

        let created = replacement_timestamp(self.system_keys.policy(), now, replaces);
        let key = CryptoKey::generate(created);
        let record = EnvelopeKeyRecord {
            revoked: None,
            created,
            encrypted_key: asherah_crypto::encrypt(&system_key, key.as_bytes())?,
            parent_key_meta: Some(sk_meta.clone()),
        };

        let meta = KeyMeta::new(ik_id.clone(), created);
        match self.system_keys.metastore().store(&ik_id, created, &record) {
            Ok(()) => {
                debug!("created intermediate key {ik_id} at {created}");
                let key = Arc::new(key);
                self.cache
                    .insert(meta.clone(), Arc::clone(&key), now, Some(sk_meta), true);
                Ok((meta, key))
            }
            Err(AsherahError::AlreadyExists { .. }) => {
                warn!("intermediate key {ik_id} at {created} was created concurrently, loading winner");
                drop(key);
                let winner = self
                    .system_keys
                    .metastore()
                    .load_latest(&ik_id)?
                    .ok_or_else(|| not_found(&meta))?;
                self.use_latest(winner, now)?.ok_or_else(|| not_found(&meta))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves a specific IK version for decryption.
    pub fn intermediate_key(&self, meta: &KeyMeta) -> AsherahResult<Arc<CryptoKey>> {
        let now = self.now();
        if let Some(cached) = self.cache.get(meta) {
            if cached.key.is_revoked() {
                return Err(revoked(meta));
            }
            let parent_revoked = cached
                .parent
                .as_ref()
                .is_some_and(|parent| self.system_keys.is_cached_revoked(parent));
            if parent_revoked {
                return Err(revoked(meta));
            }
            if !self.system_keys.policy().needs_recheck(cached.loaded_at, now) {
                return Ok(cached.key);
            }
        }

        let record = self
            .system_keys
            .metastore()
            .load(&meta.id, meta.created)?
            .ok_or_else(|| not_found(meta))?;
        if record.is_revoked() {
            self.cache.mark_revoked(meta);
            return Err(revoked(meta));
        }
        let parent = record.parent_key_meta.clone().ok_or_else(|| {
            AsherahError::DecryptionFailed(format!("intermediate key {} has no parent key", meta.id))
        })?;

        let system_key = self.system_keys.get(&parent).map_err(|e| match e {
            // The IK is unusable because its SK is.
            AsherahError::KeyRevoked { .. } => revoked(meta),
            other => other,
        })?;
        let key = decrypt_child(&system_key, &record)?;
        let latest = self
            .cache
            .get_latest(&meta.id)
            .is_none_or(|(current, _)| current.created <= meta.created);
        self.cache
            .insert(meta.clone(), Arc::clone(&key), now, Some(parent), latest);
        Ok(key)
    }

    /// Revokes this partition's latest IK. Returns false when none exists.
    pub fn revoke_current_intermediate_key(&self) -> AsherahResult<bool> {
        let ik_id = self.partition.intermediate_key_id();
        let Some(record) = self.system_keys.metastore().load_latest(&ik_id)? else {
            return Ok(false);
        };
        let meta = KeyMeta::new(ik_id, record.created);
        let revoked = self
            .system_keys
            .metastore()
            .mark_revoked(&meta.id, meta.created)?;
        self.cache.mark_revoked(&meta);
        if revoked {
            warn!("revoked intermediate key {} created {}", meta.id, meta.created);
        }
        Ok(revoked)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cached IK for this partition.
    pub fn close(&self) {
        self.cache.clear();
    }
}

/// Unwraps a key record sealed under `parent`.
fn decrypt_child(parent: &CryptoKey, record: &EnvelopeKeyRecord) -> AsherahResult<Arc<CryptoKey>> {
    let plain = Zeroizing::new(asherah_crypto::decrypt(parent, &record.encrypted_key)?);
    let key = CryptoKey::from_slice(&plain, record.created, record.is_revoked())?;
    Ok(Arc::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_never_reuses_timestamp() {
        let policy = CryptoPolicy::default();
        assert_eq!(replacement_timestamp(&policy, 1_000_010, None), 999_960);
        assert_eq!(replacement_timestamp(&policy, 120, Some(120)), 121);
        assert_eq!(replacement_timestamp(&policy, 130, Some(60)), 120);
    }
}
