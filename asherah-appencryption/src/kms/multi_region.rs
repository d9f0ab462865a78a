use super::KeyManagementService;
use crate::error::{AsherahError, AsherahResult};
use crate::types::base64_bytes;
use asherah_crypto::{Aead, ChaCha20Poly1305Aead, CryptoKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// A regional key service addressed by resource (e.g. a key ARN).
///
/// Implementations wrap a cloud KMS client for one region. Calls block.
pub trait RegionClient: Send + Sync + fmt::Debug {
    fn encrypt(&self, resource: &str, plaintext: &[u8]) -> AsherahResult<Vec<u8>>;

    fn decrypt(&self, resource: &str, ciphertext: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>>;
}

#[derive(Debug, Clone)]
struct RegionTarget {
    region: String,
    resource: String,
    client: Arc<dyn RegionClient>,
}

/// One region's copy of the wrapped data key.
#[derive(Debug, Serialize, Deserialize)]
struct RegionalKek {
    region: String,
    arn: String,
    #[serde(rename = "encryptedKek", with = "base64_bytes")]
    encrypted_kek: Vec<u8>,
}

/// Ciphertext produced by [`MultiRegionKms::encrypt_key`].
#[derive(Debug, Serialize, Deserialize)]
struct KmsEnvelope {
    #[serde(rename = "encryptedKey", with = "base64_bytes")]
    encrypted_key: Vec<u8>,
    #[serde(rename = "kmsKeks")]
    kms_keks: Vec<RegionalKek>,
}

/// KMS spanning several regions.
///
/// `encrypt_key` seals the system key under a fresh data key and wraps that
/// data key in the preferred region (required) and every other configured
/// region (best effort). `decrypt_key` tries the region tagged first in the
/// envelope, then the preferred region, then the rest in ascending name order.
#[derive(Debug)]
pub struct MultiRegionKms {
    preferred: RegionTarget,
    /// Non-preferred regions, ascending by name.
    others: Vec<RegionTarget>,
    aead: ChaCha20Poly1305Aead,
}

impl MultiRegionKms {
    pub fn new(
        region_map: &BTreeMap<String, String>,
        preferred_region: &str,
        clients: &HashMap<String, Arc<dyn RegionClient>>,
    ) -> AsherahResult<Self> {
        if region_map.is_empty() {
            return Err(AsherahError::KmsConfig("RegionMap is empty".into()));
        }

        let target = |region: &str, resource: &str| -> AsherahResult<RegionTarget> {
            let client = clients.get(region).ok_or_else(|| {
                AsherahError::KmsConfig(format!("no KMS client registered for region {region}"))
            })?;
            Ok(RegionTarget {
                region: region.to_string(),
                resource: resource.to_string(),
                client: Arc::clone(client),
            })
        };

        let preferred_resource = region_map.get(preferred_region).ok_or_else(|| {
            AsherahError::KmsConfig(format!(
                "preferred region {preferred_region} is not in RegionMap"
            ))
        })?;
        let preferred = target(preferred_region, preferred_resource)?;

        let others = region_map
            .iter()
            .filter(|(region, _)| region.as_str() != preferred_region)
            .map(|(region, resource)| target(region, resource))
            .collect::<AsherahResult<Vec<_>>>()?;

        Ok(Self {
            preferred,
            others,
            aead: ChaCha20Poly1305Aead,
        })
    }

    pub fn preferred_region(&self) -> &str {
        &self.preferred.region
    }

    fn target(&self, region: &str) -> Option<&RegionTarget> {
        std::iter::once(&self.preferred)
            .chain(self.others.iter())
            .find(|t| t.region == region)
    }

    /// Candidate regions for decryption, deduplicated, in fallback order.
    fn decrypt_order<'a>(&'a self, envelope: &'a KmsEnvelope) -> Vec<&'a str> {
        let mut order: Vec<&str> = Vec::new();
        let mut push = |region: &'a str| {
            if !order.contains(&region) {
                order.push(region);
            }
        };
        if let Some(tagged) = envelope.kms_keks.first() {
            push(tagged.region.as_str());
        }
        push(self.preferred.region.as_str());
        for other in &self.others {
            push(other.region.as_str());
        }
        order
    }
}

impl KeyManagementService for MultiRegionKms {
    fn encrypt_key(&self, key: &[u8]) -> AsherahResult<Vec<u8>> {
        let data_key = CryptoKey::generate(0);
        let encrypted_key = self.aead.encrypt(key, data_key.as_bytes())?;

        let preferred_kek = self
            .preferred
            .client
            .encrypt(&self.preferred.resource, data_key.as_bytes())?;

        let mut kms_keks = vec![RegionalKek {
            region: self.preferred.region.clone(),
            arn: self.preferred.resource.clone(),
            encrypted_kek: preferred_kek,
        }];

        for target in &self.others {
            match target.client.encrypt(&target.resource, data_key.as_bytes()) {
                Ok(encrypted_kek) => kms_keks.push(RegionalKek {
                    region: target.region.clone(),
                    arn: target.resource.clone(),
                    encrypted_kek,
                }),
                Err(e) => warn!("skipping KMS region {} for new system key: {e}", target.region),
            }
        }

        let envelope = KmsEnvelope {
            encrypted_key,
            kms_keks,
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| AsherahError::KmsUnavailable(format!("encoding KMS envelope: {e}")))
    }

    fn decrypt_key(&self, encrypted_key: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>> {
        let envelope: KmsEnvelope = serde_json::from_slice(encrypted_key)
            .map_err(|e| AsherahError::DecryptionFailed(format!("invalid KMS envelope: {e}")))?;

        let mut last_error = None;
        for region in self.decrypt_order(&envelope) {
            let Some(kek) = envelope.kms_keks.iter().find(|k| k.region == region) else {
                continue;
            };
            let Some(target) = self.target(region) else {
                continue;
            };

            let data_key = match target.client.decrypt(&kek.arn, &kek.encrypted_kek) {
                Ok(data_key) => data_key,
                Err(e) => {
                    warn!("KMS region {region} failed to decrypt data key: {e}");
                    last_error = Some(e);
                    continue;
                }
            };

            let key = self.aead.decrypt(&envelope.encrypted_key, &data_key)?;
            debug!("decrypted system key via KMS region {region}");
            return Ok(Zeroizing::new(key));
        }

        Err(AsherahError::KmsUnavailable(match last_error {
            Some(e) => format!("no configured region could decrypt the key (last error: {e})"),
            None => "envelope has no key for any configured region".into(),
        }))
    }
}

/// In-process stand-in for one region's key service.
///
/// Each resource gets its own random key on first use. The region can be
/// switched offline to exercise fallback.
#[derive(Debug)]
pub struct LocalRegionClient {
    region: String,
    keys: RwLock<HashMap<String, Arc<CryptoKey>>>,
    available: AtomicBool,
    calls: AtomicUsize,
    aead: ChaCha20Poly1305Aead,
}

impl LocalRegionClient {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            keys: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            aead: ChaCha20Poly1305Aead,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of encrypt/decrypt calls served or refused.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> AsherahResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AsherahError::KmsUnavailable(format!(
                "region {} is unreachable",
                self.region
            )))
        }
    }

    fn resource_key(&self, resource: &str, create: bool) -> AsherahResult<Arc<CryptoKey>> {
        {
            let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
            if let Some(key) = keys.get(resource) {
                return Ok(Arc::clone(key));
            }
        }
        if !create {
            return Err(AsherahError::KmsConfig(format!(
                "unknown resource {resource} in region {}",
                self.region
            )));
        }
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        let key = keys
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(CryptoKey::generate(0)));
        Ok(Arc::clone(key))
    }
}

impl RegionClient for LocalRegionClient {
    fn encrypt(&self, resource: &str, plaintext: &[u8]) -> AsherahResult<Vec<u8>> {
        self.check_available()?;
        let key = self.resource_key(resource, true)?;
        Ok(self.aead.encrypt(plaintext, key.as_bytes())?)
    }

    fn decrypt(&self, resource: &str, ciphertext: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>> {
        self.check_available()?;
        let key = self.resource_key(resource, false)?;
        Ok(Zeroizing::new(self.aead.decrypt(ciphertext, key.as_bytes())?))
    }
}
