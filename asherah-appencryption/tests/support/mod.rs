//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use asherah_appencryption::{
    Asherah, AsherahError, AsherahResult, Clock, Config, CryptoPolicy, EnvelopeKeyRecord,
    InMemoryMetastore, KeyManagementService, ManualClock, Metastore, SessionFactory, StaticKms,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use zeroize::Zeroizing;

pub const SERVICE: &str = "TestService";
pub const PRODUCT: &str = "TestProduct";

/// A start time that is not aligned to the default key precision.
pub const START: i64 = 1_700_000_000;

pub fn test_config() -> Config {
    Config::new(SERVICE, PRODUCT)
}

/// An engine set up with the static KMS and in-memory metastore.
pub fn ready_engine() -> Asherah {
    let engine = Asherah::new();
    engine.setup(&test_config()).expect("setup must succeed");
    engine
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

pub fn sk_id() -> String {
    format!("_SK_{SERVICE}_{PRODUCT}")
}

pub fn ik_id(partition: &str) -> String {
    format!("_IK_{partition}_{SERVICE}_{PRODUCT}")
}

/// A session factory over the static KMS with an injected clock and metastore.
pub fn factory_with(
    policy: CryptoPolicy,
    metastore: Arc<dyn Metastore>,
    clock: Arc<dyn Clock>,
) -> SessionFactory {
    SessionFactory::new(
        SERVICE,
        PRODUCT,
        None,
        policy,
        Arc::new(StaticKms::with_default_key()),
        metastore,
        clock,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Load(String),
    LoadLatest(String),
    Store { id: String, ok: bool },
    MarkRevoked(String),
}

/// In-memory metastore that records every call and can be slowed down,
/// failed, made read-only, or made to miss the latest version of an id once.
#[derive(Debug, Default)]
pub struct CountingMetastore {
    inner: InMemoryMetastore,
    log: Mutex<Vec<Call>>,
    delay_ms: AtomicU64,
    failing: AtomicBool,
    read_only: AtomicBool,
    slow_ids: Mutex<HashMap<String, Duration>>,
    hidden_once: Mutex<HashSet<String>>,
}

impl CountingMetastore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Rejects every `store`, after logging it as a failed attempt.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Delays only `load_latest(id)`, on top of any global delay.
    pub fn slow_down(&self, id: &str, delay: Duration) {
        self.slow_ids.lock().unwrap().insert(id.to_string(), delay);
    }

    /// The next `load_latest(id)` reports nothing, as a lagging replica would.
    pub fn hide_latest_once(&self, id: &str) {
        self.hidden_once.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn load_latest_calls(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::LoadLatest(i) if i == id))
            .count()
    }

    pub fn store_attempts(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Store { id: i, .. } if i == id))
            .count()
    }

    pub fn successful_stores(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Store { id: i, ok: true } if i == id))
            .count()
    }

    pub fn stored_versions(&self) -> usize {
        self.inner.len()
    }

    fn enter(&self, call: Call) -> AsherahResult<()> {
        self.log.lock().unwrap().push(call);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AsherahError::MetastoreUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl Metastore for CountingMetastore {
    fn load(&self, id: &str, created: i64) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        self.enter(Call::Load(id.to_string()))?;
        self.inner.load(id, created)
    }

    fn load_latest(&self, id: &str) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        self.enter(Call::LoadLatest(id.to_string()))?;
        let slow = self.slow_ids.lock().unwrap().get(id).copied();
        if let Some(delay) = slow {
            thread::sleep(delay);
        }
        if self.hidden_once.lock().unwrap().remove(id) {
            return Ok(None);
        }
        self.inner.load_latest(id)
    }

    fn store(&self, id: &str, created: i64, record: &EnvelopeKeyRecord) -> AsherahResult<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AsherahError::MetastoreUnavailable("injected failure".into()));
        }
        if self.read_only.load(Ordering::SeqCst) {
            self.log.lock().unwrap().push(Call::Store {
                id: id.to_string(),
                ok: false,
            });
            return Err(AsherahError::MetastoreUnavailable(format!("read-only: {id}")));
        }
        let result = self.inner.store(id, created, record);
        self.log.lock().unwrap().push(Call::Store {
            id: id.to_string(),
            ok: result.is_ok(),
        });
        result
    }

    fn mark_revoked(&self, id: &str, created: i64) -> AsherahResult<bool> {
        self.enter(Call::MarkRevoked(id.to_string()))?;
        self.inner.mark_revoked(id, created)
    }
}

/// Static KMS that counts calls and can be switched off.
#[derive(Debug)]
pub struct CountingKms {
    inner: StaticKms,
    pub encrypts: AtomicUsize,
    pub decrypts: AtomicUsize,
    failing: AtomicBool,
}

impl CountingKms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StaticKms::with_default_key(),
            encrypts: AtomicUsize::new(0),
            decrypts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> AsherahResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AsherahError::KmsUnavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyManagementService for CountingKms {
    fn encrypt_key(&self, key: &[u8]) -> AsherahResult<Vec<u8>> {
        self.encrypts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.encrypt_key(key)
    }

    fn decrypt_key(&self, encrypted_key: &[u8]) -> AsherahResult<Zeroizing<Vec<u8>>> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.decrypt_key(encrypted_key)
    }
}
