//! ChaCha20-Poly1305 authenticated encryption.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{fill_random, CryptoKey, KEY_SIZE};
use chacha20poly1305::aead::{Aead as _, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use std::fmt;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Authenticated encryption over raw key bytes.
///
/// Output framing is `ciphertext || tag || nonce`.
pub trait Aead: Send + Sync + fmt::Debug {
    /// Seals `data` under `key`.
    fn encrypt(&self, data: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Opens a blob produced by [`Aead::encrypt`]. Fails if the blob was
    /// tampered with or `key` is wrong.
    fn decrypt(&self, data: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// The default AEAD: ChaCha20-Poly1305 with a random trailing nonce.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaCha20Poly1305Aead;

impl ChaCha20Poly1305Aead {
    fn cipher(key: &[u8]) -> CryptoResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        })
    }
}

impl Aead for ChaCha20Poly1305Aead {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = Self::cipher(key)?;

        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce);

        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        sealed.extend_from_slice(&nonce);
        Ok(sealed)
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.len() < TAG_SIZE + NONCE_SIZE {
            return Err(CryptoError::CiphertextTooShort { len: data.len() });
        }
        let cipher = Self::cipher(key)?;

        let (body, nonce) = data.split_at(data.len() - NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| {
                CryptoError::Decryption("authentication failed (wrong key or tampered data)".into())
            })
    }
}

/// Seals `data` under `key` with the default AEAD.
pub fn encrypt(key: &CryptoKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
    ChaCha20Poly1305Aead.encrypt(data, key.as_bytes())
}

/// Opens a blob sealed by [`encrypt`].
pub fn decrypt(key: &CryptoKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
    ChaCha20Poly1305Aead.decrypt(data, key.as_bytes())
}
