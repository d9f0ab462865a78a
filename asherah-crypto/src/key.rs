//! Symmetric key material.

use crate::error::{CryptoError, CryptoResult};
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every key in the hierarchy (256 bits).
pub const KEY_SIZE: usize = 32;

/// Fills `buf` from the thread-local CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
}

/// A 256-bit symmetric key with its creation timestamp and revocation flag.
///
/// The key bytes are overwritten with zeros when the key is dropped. A key is
/// deliberately not `Clone`: exactly one owner (usually a cache slot behind an
/// `Arc`) is responsible for it, and cipher calls only ever borrow it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey {
    bytes: [u8; KEY_SIZE],
    created: i64,
    #[zeroize(skip)]
    revoked: AtomicBool,
}

impl CryptoKey {
    /// Generates a fresh random key stamped with `created` (Unix seconds).
    pub fn generate(created: i64) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        fill_random(&mut bytes);
        Self::from_bytes(bytes, created, false)
    }

    /// Wraps existing key bytes. The array is moved in, so the caller holds no copy.
    pub fn from_bytes(bytes: [u8; KEY_SIZE], created: i64, revoked: bool) -> Self {
        Self {
            bytes,
            created,
            revoked: AtomicBool::new(revoked),
        }
    }

    /// Copies key bytes out of a decrypted buffer. The caller stays responsible
    /// for wiping `bytes`.
    pub fn from_slice(bytes: &[u8], created: i64, revoked: bool) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self::from_bytes(arr, created, revoked))
    }

    /// Raw key bytes. Never log or persist these.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Creation timestamp in Unix seconds.
    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Flags the key as revoked. Revocation is one-way.
    pub fn mark_revoked(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("bytes", &"[REDACTED]")
            .field("created", &self.created)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
