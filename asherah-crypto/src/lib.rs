//! Cryptographic primitives for Asherah.
//!
//! Provides the building blocks of the envelope key hierarchy:
//! - ChaCha20-Poly1305 for authenticated encryption
//! - 256-bit key material that is zeroized when dropped
//!
//! # Framing
//!
//! Every sealed blob produced by this crate is laid out as
//! `ciphertext || tag || nonce`. The nonce is random per call, so sealing the
//! same plaintext twice never yields the same bytes.
//!
//! Nothing here performs I/O or caching. Key lifecycles (rotation, expiry,
//! revocation) belong to the application encryption layer.

mod cipher;
mod error;
mod key;

pub use cipher::{decrypt, encrypt, Aead, ChaCha20Poly1305Aead, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{fill_random, CryptoKey, KEY_SIZE};
