//! Key management services wrap the root of the key hierarchy.
//!
//! A KMS only ever sees system key material: it encrypts a freshly generated
//! SK before it is persisted and decrypts it again when loaded.
//!
//! - [`StaticKms`]: one in-process master key (development and tests)
//! - [`MultiRegionKms`]: envelope over several regional key services, so any
//!   configured region can recover a system key

mod multi_region;
mod static_kms;

pub use multi_region::{LocalRegionClient, MultiRegionKms, RegionClient};
pub use static_kms::{StaticKms, DEFAULT_STATIC_MASTER_KEY};

use crate::error::AsherahResult;
use std::fmt;
use zeroize::Zeroizing;

/// Encrypts and decrypts system key material under a root key.
pub trait KeyManagementService: Send + Sync + fmt::Debug {
    fn encrypt_key(&self, key: &[u8]) -> AsherahResult<Vec<u8>>;

    fn decrypt_key(&self, encrypted_key: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>>;
}
