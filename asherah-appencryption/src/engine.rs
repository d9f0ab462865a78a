//! The engine handle.
//!
//! [`Asherah`] wraps the whole lifecycle: `setup` validates a [`Config`] and
//! builds the adapters and session factory, the encrypt/decrypt family runs
//! against it, and `shutdown` wipes every cached key. Handles are cheap to
//! clone and independent instances can coexist in one process.

use crate::buffer::BufferSizing;
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::{Config, KmsKind, MetastoreKind, ValidatedConfig};
use crate::error::{AsherahError, AsherahResult};
use crate::kms::{KeyManagementService, MultiRegionKms, RegionClient, StaticKms};
use crate::logging;
use crate::metastore::{InMemoryMetastore, Metastore, SqlMetastore};
use crate::session::SessionFactory;
use crate::timeout::{AdapterRuntime, TimedKms, TimedMetastore};
use crate::types::DataRowRecord;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Adapters supplied by the host instead of being built from config.
#[derive(Debug, Default)]
struct Overrides {
    kms: Option<Arc<dyn KeyManagementService>>,
    metastore: Option<Arc<dyn Metastore>>,
    region_clients: HashMap<String, Arc<dyn RegionClient>>,
    clock: Option<Arc<dyn Clock>>,
}

#[derive(Debug, Default)]
struct Inner {
    factory: RwLock<Option<Arc<SessionFactory>>>,
    sizing: BufferSizing,
    overrides: Overrides,
}

/// Envelope encryption engine handle.
#[derive(Debug, Clone, Default)]
pub struct Asherah {
    inner: Arc<Inner>,
}

/// Configures adapters that [`Config`] cannot express.
#[derive(Debug, Default)]
pub struct AsherahBuilder {
    overrides: Overrides,
}

impl AsherahBuilder {
    /// Uses `kms` instead of the one named by `KMS`.
    pub fn with_kms(mut self, kms: Arc<dyn KeyManagementService>) -> Self {
        self.overrides.kms = Some(kms);
        self
    }

    /// Uses `metastore` instead of the one named by `Metastore`. Required for
    /// `dynamodb`.
    pub fn with_metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.overrides.metastore = Some(metastore);
        self
    }

    /// Registers the key service client for one `RegionMap` region.
    pub fn with_region_client(mut self, region: &str, client: Arc<dyn RegionClient>) -> Self {
        self.overrides
            .region_clients
            .insert(region.to_string(), client);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.overrides.clock = Some(clock);
        self
    }

    pub fn build(self) -> Asherah {
        Asherah {
            inner: Arc::new(Inner {
                factory: RwLock::new(None),
                sizing: BufferSizing::new(),
                overrides: self.overrides,
            }),
        }
    }
}

fn require_partition(partition_id: &str) -> AsherahResult<()> {
    if partition_id.is_empty() {
        return Err(AsherahError::InvalidArgument("partition id is empty".into()));
    }
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> AsherahResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AsherahResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AsherahError::Task(e.to_string()))?
}

impl Asherah {
    /// An uninitialized engine that builds every adapter from config.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> AsherahBuilder {
        AsherahBuilder::default()
    }

    fn build_kms(&self, config: &ValidatedConfig) -> AsherahResult<Arc<dyn KeyManagementService>> {
        if let Some(kms) = &self.inner.overrides.kms {
            return Ok(Arc::clone(kms));
        }
        let kms: Arc<dyn KeyManagementService> = match &config.kms {
            KmsKind::Static { master_key: None } => Arc::new(StaticKms::with_default_key()),
            KmsKind::Static {
                master_key: Some(key),
            } => Arc::new(StaticKms::new(key)?),
            KmsKind::MultiRegion {
                region_map,
                preferred_region,
            } => Arc::new(MultiRegionKms::new(
                region_map,
                preferred_region,
                &self.inner.overrides.region_clients,
            )?),
        };
        Ok(kms)
    }

    fn build_metastore(&self, config: &ValidatedConfig) -> AsherahResult<Arc<dyn Metastore>> {
        if let Some(metastore) = &self.inner.overrides.metastore {
            return Ok(Arc::clone(metastore));
        }
        let metastore: Arc<dyn Metastore> = match &config.metastore {
            MetastoreKind::Memory => Arc::new(InMemoryMetastore::new()),
            MetastoreKind::Rdbms { connection_string } => {
                Arc::new(SqlMetastore::open(connection_string)?)
            }
            MetastoreKind::DynamoDb { .. } => {
                return Err(AsherahError::Config(
                    "Metastore dynamodb has no bundled adapter; inject one with AsherahBuilder::with_metastore"
                        .into(),
                ));
            }
        };
        Ok(metastore)
    }

    /// Validates `config` and initializes the engine.
    ///
    /// Fails with `AlreadyInitialized` if the engine is already set up.
    pub fn setup(&self, config: &Config) -> AsherahResult<()> {
        let validated = config.validate()?;
        if validated.verbose {
            logging::init(true);
        }

        let mut slot = self
            .inner
            .factory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(AsherahError::AlreadyInitialized);
        }

        let runtime = validated
            .policy
            .adapter_timeout
            .map(AdapterRuntime::new)
            .transpose()?
            .map(Arc::new);
        let kms: Arc<dyn KeyManagementService> =
            Arc::new(TimedKms::new(self.build_kms(&validated)?, runtime.clone()));
        let metastore: Arc<dyn Metastore> =
            Arc::new(TimedMetastore::new(self.build_metastore(&validated)?, runtime));
        let clock = self
            .inner
            .overrides
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock));

        let factory = SessionFactory::new(
            &validated.service_name,
            &validated.product_id,
            validated.region_suffix.clone(),
            validated.policy.clone(),
            kms,
            metastore,
            clock,
        );
        info!(
            "asherah initialized for service {} product {} (kms {}, metastore {:?})",
            validated.service_name,
            validated.product_id,
            kms_name(&validated.kms),
            validated.metastore
        );
        *slot = Some(Arc::new(factory));
        Ok(())
    }

    /// Parses a JSON config and calls [`setup`](Self::setup).
    pub fn setup_json(&self, json: &str) -> AsherahResult<()> {
        self.setup(&Config::from_json(json)?)
    }

    /// Closes every session and wipes cached keys. Calling it on an engine that
    /// is not set up does nothing.
    pub fn shutdown(&self) {
        let factory = self
            .inner
            .factory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(factory) = factory {
            factory.close();
            info!("asherah shut down");
        }
    }

    /// Whether `setup` has succeeded and `shutdown` has not run since.
    pub fn get_setup_status(&self) -> bool {
        self.inner
            .factory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The session factory of a set-up engine.
    pub fn session_factory(&self) -> AsherahResult<Arc<SessionFactory>> {
        self.inner
            .factory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AsherahError::NotInitialized)
    }

    pub fn encrypt(&self, partition_id: &str, data: &[u8]) -> AsherahResult<DataRowRecord> {
        let factory = self.session_factory()?;
        require_partition(partition_id)?;
        if data.is_empty() {
            return Err(AsherahError::InvalidArgument("data is empty".into()));
        }

        let staged = self.inner.sizing.stage(data);
        let session = factory.session(partition_id)?;
        let record = session.encrypt(&staged)?;
        debug!("encrypted {} bytes for partition {partition_id}", data.len());
        Ok(record)
    }

    pub fn decrypt(&self, partition_id: &str, record: &DataRowRecord) -> AsherahResult<Vec<u8>> {
        let factory = self.session_factory()?;
        require_partition(partition_id)?;
        factory.decrypt_session(partition_id)?.decrypt(record)
    }

    /// Encrypts and returns the record in its JSON form.
    pub fn encrypt_to_json(&self, partition_id: &str, data: &[u8]) -> AsherahResult<String> {
        let record = self.encrypt(partition_id, data)?;
        let capacity = self
            .inner
            .sizing
            .estimate_output_size(data.len(), partition_id.len());
        codec::encode_json_with_capacity(&record, capacity)
    }

    /// Decrypts a record given in its JSON form.
    pub fn decrypt_from_json(&self, partition_id: &str, json: &str) -> AsherahResult<Vec<u8>> {
        self.session_factory()?;
        require_partition(partition_id)?;
        let staged = self.inner.sizing.stage(json.as_bytes());
        let json = std::str::from_utf8(&staged)
            .map_err(|e| AsherahError::MalformedRecord(e.to_string()))?;
        let record = codec::decode_json(json)?;
        self.decrypt(partition_id, &record)
    }

    pub fn encrypt_string(&self, partition_id: &str, data: &str) -> AsherahResult<String> {
        self.encrypt_to_json(partition_id, data.as_bytes())
    }

    /// Decrypts a JSON record whose plaintext must be UTF-8.
    pub fn decrypt_string(&self, partition_id: &str, json: &str) -> AsherahResult<String> {
        let plain = Zeroizing::new(self.decrypt_from_json(partition_id, json)?);
        std::str::from_utf8(&plain)
            .map(str::to_string)
            .map_err(|_| AsherahError::InvalidArgument("decrypted data is not valid UTF-8".into()))
    }

    /// Revokes the current intermediate key of `partition_id`. Returns false
    /// when the partition has no key yet.
    pub fn revoke_intermediate_key(&self, partition_id: &str) -> AsherahResult<bool> {
        self.session_factory()?.revoke_intermediate_key(partition_id)
    }

    /// Revokes the current system key. Returns false when none exists yet.
    pub fn revoke_system_key(&self) -> AsherahResult<bool> {
        self.session_factory()?.revoke_system_key()
    }

    /// Sets the inline staging threshold; see [`BufferSizing`].
    pub fn set_max_stack_alloc_item_size(&self, size: i64) -> usize {
        self.inner.sizing.set_max_stack_alloc_item_size(size)
    }

    /// Sets the output estimate padding; see [`BufferSizing`].
    pub fn set_safety_padding_overhead(&self, padding: i64) -> usize {
        self.inner.sizing.set_safety_padding_overhead(padding)
    }

    pub fn buffer_sizing(&self) -> &BufferSizing {
        &self.inner.sizing
    }

    pub async fn setup_async(&self, config: Config) -> AsherahResult<()> {
        let this = self.clone();
        run_blocking(move || this.setup(&config)).await
    }

    pub async fn shutdown_async(&self) -> AsherahResult<()> {
        let this = self.clone();
        run_blocking(move || {
            this.shutdown();
            Ok(())
        })
        .await
    }

    pub async fn encrypt_async(
        &self,
        partition_id: &str,
        data: &[u8],
    ) -> AsherahResult<DataRowRecord> {
        let this = self.clone();
        let partition_id = partition_id.to_string();
        let data = Zeroizing::new(data.to_vec());
        run_blocking(move || this.encrypt(&partition_id, &data)).await
    }

    pub async fn decrypt_async(
        &self,
        partition_id: &str,
        record: &DataRowRecord,
    ) -> AsherahResult<Vec<u8>> {
        let this = self.clone();
        let partition_id = partition_id.to_string();
        let record = record.clone();
        run_blocking(move || this.decrypt(&partition_id, &record)).await
    }

    pub async fn encrypt_string_async(&self, partition_id: &str, data: &str) -> AsherahResult<String> {
        let this = self.clone();
        let partition_id = partition_id.to_string();
        let data = Zeroizing::new(data.to_string());
        run_blocking(move || this.encrypt_string(&partition_id, &data)).await
    }

    pub async fn decrypt_string_async(&self, partition_id: &str, json: &str) -> AsherahResult<String> {
        let this = self.clone();
        let partition_id = partition_id.to_string();
        let json = json.to_string();
        run_blocking(move || this.decrypt_string(&partition_id, &json)).await
    }
}

fn kms_name(kms: &KmsKind) -> &'static str {
    match kms {
        KmsKind::Static { .. } => "static",
        KmsKind::MultiRegion { .. } => "aws",
    }
}
