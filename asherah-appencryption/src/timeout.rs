//! Bounded adapter calls.
//!
//! KMS and metastore implementations block. When an adapter timeout is
//! configured each call runs on the blocking pool of a small engine-owned
//! tokio runtime and the caller waits at most that long, so a hung backend
//! surfaces as `KmsUnavailable` or `MetastoreUnavailable` instead of stalling a
//! partition's derivation lock. The pool is capped, so calls stuck in a hung
//! backend never hold more than [`ADAPTER_THREADS`] threads.

use crate::error::{AsherahError, AsherahResult};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::types::EnvelopeKeyRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::warn;
use zeroize::Zeroizing;

/// Upper bound on threads running adapter calls at once.
pub const ADAPTER_THREADS: usize = 8;

/// Runtime that drives timed adapter calls for one engine.
#[derive(Debug)]
pub struct AdapterRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
    timeout: Duration,
}

impl AdapterRuntime {
    pub fn new(timeout: Duration) -> AsherahResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(ADAPTER_THREADS)
            .thread_name("asherah-adapter")
            .enable_time()
            .build()
            .map_err(|e| AsherahError::Config(format!("could not start adapter runtime: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            timeout,
        })
    }

    /// Runs `call` on the blocking pool and waits up to the timeout for it.
    ///
    /// Must be called from a thread that is not driving async tasks; the async
    /// engine wrappers already move work onto `spawn_blocking`.
    fn run<T, F>(
        &self,
        op: &'static str,
        call: F,
        on_timeout: fn(String) -> AsherahError,
    ) -> AsherahResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AsherahResult<T> + Send + 'static,
    {
        let timeout = self.timeout;
        let task = self.handle.spawn_blocking(call);
        // The timer must be created inside the runtime context.
        let waited = self
            .handle
            .block_on(async move { tokio::time::timeout(timeout, task).await });
        match waited {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(on_timeout(format!("{op} worker failed: {e}"))),
            Err(_) => {
                warn!("{op} exceeded adapter timeout of {timeout:?}");
                Err(on_timeout(format!("{op} timed out after {timeout:?}")))
            }
        }
    }
}

impl Drop for AdapterRuntime {
    fn drop(&mut self) {
        // Hung adapter calls must not block shutdown, which may run on an
        // async task.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// KMS decorator enforcing an optional per-call timeout.
#[derive(Debug)]
pub struct TimedKms {
    inner: Arc<dyn KeyManagementService>,
    runtime: Option<Arc<AdapterRuntime>>,
}

impl TimedKms {
    pub fn new(inner: Arc<dyn KeyManagementService>, runtime: Option<Arc<AdapterRuntime>>) -> Self {
        Self { inner, runtime }
    }
}

impl KeyManagementService for TimedKms {
    fn encrypt_key(&self, key: &[u8]) -> AsherahResult<Vec<u8>> {
        let Some(runtime) = &self.runtime else {
            return self.inner.encrypt_key(key);
        };
        let inner = Arc::clone(&self.inner);
        let key = Zeroizing::new(key.to_vec());
        runtime.run(
            "kms.encrypt_key",
            move || inner.encrypt_key(&key),
            AsherahError::KmsUnavailable,
        )
    }

    fn decrypt_key(&self, encrypted_key: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>> {
        let Some(runtime) = &self.runtime else {
            return self.inner.decrypt_key(encrypted_key);
        };
        let inner = Arc::clone(&self.inner);
        let encrypted_key = encrypted_key.to_vec();
        runtime.run(
            "kms.decrypt_key",
            move || inner.decrypt_key(&encrypted_key),
            AsherahError::KmsUnavailable,
        )
    }
}

/// Metastore decorator enforcing an optional per-call timeout.
#[derive(Debug)]
pub struct TimedMetastore {
    inner: Arc<dyn Metastore>,
    runtime: Option<Arc<AdapterRuntime>>,
}

impl TimedMetastore {
    pub fn new(inner: Arc<dyn Metastore>, runtime: Option<Arc<AdapterRuntime>>) -> Self {
        Self { inner, runtime }
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> AsherahResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Metastore) -> AsherahResult<T> + Send + 'static,
    {
        match &self.runtime {
            None => f(self.inner.as_ref()),
            Some(runtime) => {
                let inner = Arc::clone(&self.inner);
                runtime.run(
                    op,
                    move || f(inner.as_ref()),
                    AsherahError::MetastoreUnavailable,
                )
            }
        }
    }
}

impl Metastore for TimedMetastore {
    fn load(&self, id: &str, created: i64) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let id = id.to_string();
        self.call("metastore.load", move |m| m.load(&id, created))
    }

    fn load_latest(&self, id: &str) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let id = id.to_string();
        self.call("metastore.load_latest", move |m| m.load_latest(&id))
    }

    fn store(&self, id: &str, created: i64, record: &EnvelopeKeyRecord) -> AsherahResult<()> {
        let id = id.to_string();
        let record = record.clone();
        self.call("metastore.store", move |m| m.store(&id, created, &record))
    }

    fn mark_revoked(&self, id: &str, created: i64) -> AsherahResult<bool> {
        let id = id.to_string();
        self.call("metastore.mark_revoked", move |m| m.mark_revoked(&id, created))
    }
}
