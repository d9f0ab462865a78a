//! Application-level envelope encryption.
//!
//! Data is protected by a three-level key hierarchy:
//!
//! ```text
//! KMS master key
//!   └─ System key (SK)         one per service/product, stored in the metastore
//!        └─ Intermediate key (IK)   one per partition, stored in the metastore
//!             └─ Data row key (DRK)  one per encryption, stored inside the record
//! ```
//!
//! SKs and IKs are created lazily, rotated after they expire, and cached in
//! memory. The [`Asherah`] handle is the usual entry point:
//!
//! ```no_run
//! use asherah_appencryption::{Asherah, Config};
//!
//! # fn main() -> asherah_appencryption::AsherahResult<()> {
//! let engine = Asherah::new();
//! engine.setup(&Config::new("TestService", "TestProduct"))?;
//!
//! let record = engine.encrypt("partition", b"mysecretdata")?;
//! assert_eq!(engine.decrypt("partition", &record)?, b"mysecretdata");
//!
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
mod hierarchy;
mod key_cache;
pub mod kms;
pub mod logging;
pub mod metastore;
pub mod partition;
pub mod policy;
pub mod session;
mod session_cache;
pub mod timeout;
pub mod types;

pub use buffer::{BufferSizing, StagingBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, KmsKind, MetastoreKind, ValidatedConfig};
pub use engine::{Asherah, AsherahBuilder};
pub use error::{AsherahError, AsherahResult};
pub use kms::{
    KeyManagementService, LocalRegionClient, MultiRegionKms, RegionClient, StaticKms,
    DEFAULT_STATIC_MASTER_KEY,
};
pub use metastore::{InMemoryMetastore, Metastore, SqlMetastore};
pub use partition::Partition;
pub use policy::CryptoPolicy;
pub use session::{Session, SessionFactory};
pub use types::{DataRowRecord, EnvelopeKeyRecord, KeyMeta};
