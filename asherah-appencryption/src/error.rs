//! Application encryption error types.

use asherah_crypto::CryptoError;
use thiserror::Error;

/// Result type for application encryption operations.
pub type AsherahResult<T> = Result<T, AsherahError>;

/// Errors that can occur while encrypting, decrypting, or managing keys.
#[derive(Debug, Error)]
pub enum AsherahError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not initialized: call setup first")]
    NotInitialized,

    #[error("already initialized: call shutdown before setup")]
    AlreadyInitialized,

    #[error("key not found: {id} created {created}")]
    KeyNotFound { id: String, created: i64 },

    #[error("key revoked: {id} created {created}")]
    KeyRevoked { id: String, created: i64 },

    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    #[error("KMS configuration error: {0}")]
    KmsConfig(String),

    #[error("metastore unavailable: {0}")]
    MetastoreUnavailable(String),

    #[error("key already exists: {id} created {created}")]
    AlreadyExists { id: String, created: i64 },

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("malformed data row record: {0}")]
    MalformedRecord(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<CryptoError> for AsherahError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Decryption(msg) => AsherahError::DecryptionFailed(msg),
            CryptoError::CiphertextTooShort { len } => {
                AsherahError::DecryptionFailed(format!("ciphertext too short: {len} bytes"))
            }
            other => AsherahError::Crypto(other),
        }
    }
}

impl AsherahError {
    /// Rebuilds an equivalent error so one failed derivation can be reported
    /// to every caller that was waiting on it.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(m.clone()),
            Self::NotInitialized => Self::NotInitialized,
            Self::AlreadyInitialized => Self::AlreadyInitialized,
            Self::KeyNotFound { id, created } => Self::KeyNotFound {
                id: id.clone(),
                created: *created,
            },
            Self::KeyRevoked { id, created } => Self::KeyRevoked {
                id: id.clone(),
                created: *created,
            },
            Self::KmsUnavailable(m) => Self::KmsUnavailable(m.clone()),
            Self::KmsConfig(m) => Self::KmsConfig(m.clone()),
            Self::MetastoreUnavailable(m) => Self::MetastoreUnavailable(m.clone()),
            Self::AlreadyExists { id, created } => Self::AlreadyExists {
                id: id.clone(),
                created: *created,
            },
            Self::DecryptionFailed(m) => Self::DecryptionFailed(m.clone()),
            Self::MalformedRecord(m) => Self::MalformedRecord(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
            Self::Crypto(e) => Self::Crypto(e.clone()),
            Self::Task(m) => Self::Task(m.clone()),
        }
    }
}
