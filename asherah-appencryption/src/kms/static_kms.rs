use super::KeyManagementService;
use crate::error::{AsherahError, AsherahResult};
use asherah_crypto::{Aead, ChaCha20Poly1305Aead, CryptoKey, KEY_SIZE};
use zeroize::Zeroizing;

/// Well-known development master key. Never use it for real data.
pub const DEFAULT_STATIC_MASTER_KEY: &[u8; KEY_SIZE] = b"thisIsAStaticMasterKeyForTesting";

/// KMS backed by a single master key held in process memory.
#[derive(Debug)]
pub struct StaticKms {
    master_key: CryptoKey,
    aead: ChaCha20Poly1305Aead,
}

impl StaticKms {
    pub fn new(master_key: &[u8]) -> AsherahResult<Self> {
        let master_key = CryptoKey::from_slice(master_key, 0, false).map_err(|e| {
            AsherahError::KmsConfig(format!("static master key: {e}"))
        })?;
        Ok(Self {
            master_key,
            aead: ChaCha20Poly1305Aead,
        })
    }

    /// A static KMS using [`DEFAULT_STATIC_MASTER_KEY`].
    pub fn with_default_key() -> Self {
        Self {
            master_key: CryptoKey::from_bytes(*DEFAULT_STATIC_MASTER_KEY, 0, false),
            aead: ChaCha20Poly1305Aead,
        }
    }
}

impl KeyManagementService for StaticKms {
    fn encrypt_key(&self, key: &[u8]) -> AsherahResult<Vec<u8>> {
        Ok(self.aead.encrypt(key, self.master_key.as_bytes())?)
    }

    fn decrypt_key(&self, encrypted_key: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>> {
        let plain = self.aead.decrypt(encrypted_key, self.master_key.as_bytes())?;
        Ok(Zeroizing::new(plain))
    }
}
