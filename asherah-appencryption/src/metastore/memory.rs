use super::Metastore;
use crate::error::{AsherahError, AsherahResult};
use crate::types::EnvelopeKeyRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Process-local metastore. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    records: RwLock<HashMap<String, BTreeMap<i64, EnvelopeKeyRecord>>>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored key versions.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .map(|r| r.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AsherahError {
    AsherahError::MetastoreUnavailable(format!("metastore lock poisoned: {e}"))
}

impl Metastore for InMemoryMetastore {
    fn load(&self, id: &str, created: i64) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(id).and_then(|versions| versions.get(&created)).cloned())
    }

    fn load_latest(&self, id: &str) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(id)
            .and_then(|versions| versions.last_key_value())
            .map(|(_, record)| record.clone()))
    }

    fn store(&self, id: &str, created: i64, record: &EnvelopeKeyRecord) -> AsherahResult<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        let versions = records.entry(id.to_string()).or_default();
        if versions.contains_key(&created) {
            return Err(AsherahError::AlreadyExists {
                id: id.to_string(),
                created,
            });
        }
        versions.insert(created, record.clone());
        Ok(())
    }

    fn mark_revoked(&self, id: &str, created: i64) -> AsherahResult<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(id).and_then(|versions| versions.get_mut(&created)) {
            Some(record) => {
                record.revoked = Some(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
