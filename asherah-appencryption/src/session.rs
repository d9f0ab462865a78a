//! Per-partition sessions and the factory that hands them out.

use crate::clock::Clock;
use crate::codec;
use crate::error::{AsherahError, AsherahResult};
use crate::hierarchy::{KeyHierarchy, SystemKeyManager};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::partition::Partition;
use crate::policy::CryptoPolicy;
use crate::session_cache::SessionCache;
use crate::types::{DataRowRecord, EnvelopeKeyRecord};
use asherah_crypto::CryptoKey;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Encrypts and decrypts data rows for one partition.
///
/// Every `encrypt` uses a fresh data row key, sealed under the partition's
/// current intermediate key and discarded once the record is built.
#[derive(Debug)]
pub struct Session {
    hierarchy: KeyHierarchy,
}

impl Session {
    pub(crate) fn new(partition: Partition, system_keys: Arc<SystemKeyManager>) -> Self {
        Self {
            hierarchy: KeyHierarchy::new(partition, system_keys),
        }
    }

    pub fn partition_id(&self) -> &str {
        self.hierarchy.partition().id()
    }

    /// Resolves the current IK now so later calls hit the cache.
    pub(crate) fn warm(&self) -> AsherahResult<()> {
        self.hierarchy.current_intermediate_key().map(|_| ())
    }

    pub fn encrypt(&self, data: &[u8]) -> AsherahResult<DataRowRecord> {
        let (ik_meta, ik) = self.hierarchy.current_intermediate_key()?;

        let created = self.hierarchy.now();
        let drk = CryptoKey::generate(created);
        let data = asherah_crypto::encrypt(&drk, data)?;
        let encrypted_key = asherah_crypto::encrypt(&ik, drk.as_bytes())?;
        drop(drk);

        Ok(DataRowRecord {
            key: EnvelopeKeyRecord {
                revoked: None,
                created,
                encrypted_key,
                parent_key_meta: Some(ik_meta),
            },
            data,
        })
    }

    pub fn decrypt(&self, record: &DataRowRecord) -> AsherahResult<Vec<u8>> {
        codec::validate(record)?;
        let parent = record
            .key
            .parent_key_meta
            .as_ref()
            .ok_or_else(|| AsherahError::MalformedRecord("missing Key.ParentKeyMeta".into()))?;

        let partition = self.hierarchy.partition();
        if !partition.is_valid_intermediate_key_id(&parent.id) {
            return Err(AsherahError::DecryptionFailed(format!(
                "record was not encrypted for partition {}",
                partition.id()
            )));
        }

        let ik = self.hierarchy.intermediate_key(parent)?;
        let drk_bytes = Zeroizing::new(asherah_crypto::decrypt(&ik, &record.key.encrypted_key)?);
        let drk = CryptoKey::from_slice(&drk_bytes, record.key.created, false)?;
        Ok(asherah_crypto::decrypt(&drk, &record.data)?)
    }

    pub(crate) fn revoke_intermediate_key(&self) -> AsherahResult<bool> {
        self.hierarchy.revoke_current_intermediate_key()
    }

    /// Number of intermediate keys this session holds in memory.
    pub fn cached_key_count(&self) -> usize {
        self.hierarchy.cached_len()
    }

    /// Wipes this session's cached keys. The session stays usable and reloads
    /// keys from the metastore on demand.
    pub fn close(&self) {
        self.hierarchy.close();
    }
}

/// Builds sessions for one service/product and owns the shared system key
/// cache and the optional session cache.
#[derive(Debug)]
pub struct SessionFactory {
    service: String,
    product: String,
    region_suffix: Option<String>,
    system_keys: Arc<SystemKeyManager>,
    sessions: Option<SessionCache>,
}

impl SessionFactory {
    pub fn new(
        service: &str,
        product: &str,
        region_suffix: Option<String>,
        policy: CryptoPolicy,
        kms: Arc<dyn KeyManagementService>,
        metastore: Arc<dyn Metastore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let region_suffix = region_suffix.filter(|s| !s.is_empty());
        let system_key_id = Partition::new("", service, product)
            .with_suffix(region_suffix.clone())
            .system_key_id();

        let sessions = policy.cache_sessions.then(|| {
            SessionCache::new(
                policy.session_cache_max_size,
                policy.session_cache_duration_secs,
                Arc::clone(&clock),
            )
        });
        let system_keys = Arc::new(SystemKeyManager::new(
            system_key_id,
            Arc::new(policy),
            kms,
            metastore,
            clock,
        ));

        Self {
            service: service.to_string(),
            product: product.to_string(),
            region_suffix,
            system_keys,
            sessions,
        }
    }

    fn partition_session(&self, partition_id: &str) -> Session {
        let partition = Partition::new(partition_id, &self.service, &self.product)
            .with_suffix(self.region_suffix.clone());
        Session::new(partition, Arc::clone(&self.system_keys))
    }

    fn new_session(&self, partition_id: &str) -> AsherahResult<Session> {
        let session = self.partition_session(partition_id);
        session.warm()?;
        debug!("derived session for partition {partition_id}");
        Ok(session)
    }

    /// Returns the session for `partition_id`, deriving it if it is not cached.
    ///
    /// A derived session has already resolved its current IK, creating the
    /// partition's keys if they are missing or expired.
    pub fn session(&self, partition_id: &str) -> AsherahResult<Arc<Session>> {
        if partition_id.is_empty() {
            return Err(AsherahError::InvalidArgument("partition id is empty".into()));
        }
        match &self.sessions {
            Some(cache) => cache.acquire(partition_id, || self.new_session(partition_id)),
            None => self.new_session(partition_id).map(Arc::new),
        }
    }

    /// Returns a session for decrypting existing records of `partition_id`.
    ///
    /// Unlike [`session`](Self::session) this never resolves the current IK,
    /// so it neither creates keys nor needs the KMS to encrypt. A session
    /// derived here is cached and warms itself on its first `encrypt`.
    pub fn decrypt_session(&self, partition_id: &str) -> AsherahResult<Arc<Session>> {
        if partition_id.is_empty() {
            return Err(AsherahError::InvalidArgument("partition id is empty".into()));
        }
        match &self.sessions {
            Some(cache) => cache.acquire(partition_id, || Ok(self.partition_session(partition_id))),
            None => Ok(Arc::new(self.partition_session(partition_id))),
        }
    }

    /// Revokes the current system key. The next encryption rotates to a new
    /// SK and new IKs.
    pub fn revoke_system_key(&self) -> AsherahResult<bool> {
        self.system_keys.revoke_current()
    }

    /// Revokes the current intermediate key of `partition_id`.
    pub fn revoke_intermediate_key(&self, partition_id: &str) -> AsherahResult<bool> {
        if partition_id.is_empty() {
            return Err(AsherahError::InvalidArgument("partition id is empty".into()));
        }
        let cached = self.sessions.as_ref().and_then(|cache| cache.get(partition_id));
        match cached {
            Some(session) => session.revoke_intermediate_key(),
            None => self.partition_session(partition_id).revoke_intermediate_key(),
        }
    }

    pub fn system_key_id(&self) -> &str {
        self.system_keys.key_id()
    }

    pub fn cached_session_count(&self) -> usize {
        self.sessions.as_ref().map_or(0, SessionCache::len)
    }

    pub fn cached_system_key_count(&self) -> usize {
        self.system_keys.cached_len()
    }

    /// Closes every cached session and wipes the system key cache.
    pub fn close(&self) {
        if let Some(cache) = &self.sessions {
            cache.close_all();
        }
        self.system_keys.close();
    }
}
