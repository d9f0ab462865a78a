//! Bounded cache of per-partition sessions.
//!
//! The map lock is held only for bookkeeping (lookup, LRU order, eviction).
//! Derivation happens under a per-partition slot mutex, so concurrent callers
//! for one new partition wait for a single derivation while other partitions
//! proceed independently. A failed derivation is reported to every caller that
//! was already waiting on it; later callers try again.
//!
//! Eviction never waits on a slot mutex. It flags the slot, and whoever holds
//! the mutex at that moment wipes the session once it lets go.

use crate::clock::Clock;
use crate::error::{AsherahError, AsherahResult};
use crate::session::Session;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use tracing::debug;

#[derive(Debug, Default)]
struct SlotState {
    session: Option<Arc<Session>>,
    last_error: Option<AsherahError>,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    /// Completed derivation attempts.
    attempts: AtomicU64,
    /// Set once the slot has left the cache.
    evicted: AtomicBool,
}

impl Slot {
    /// Wipes the slot's session if its mutex is free. A holder of the mutex
    /// sees `evicted` after unlocking and wipes it instead.
    fn close(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(session) = state.session.take() {
            session.close();
        }
    }

    /// Hands `session` out after the slot mutex is released.
    fn release(&self, session: Arc<Session>) -> Arc<Session> {
        if self.evicted.load(Ordering::SeqCst) {
            session.close();
        }
        session
    }
}

#[derive(Debug)]
struct Entry {
    slot: Arc<Slot>,
    tick: u64,
    last_access: i64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Access order, oldest first.
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl CacheInner {
    fn touch(&mut self, partition_id: &str, now: i64) -> Arc<Slot> {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(entry) = self.entries.get_mut(partition_id) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = now;
            self.order.insert(tick, partition_id.to_string());
            return Arc::clone(&entry.slot);
        }

        let slot = Arc::new(Slot::default());
        self.entries.insert(
            partition_id.to_string(),
            Entry {
                slot: Arc::clone(&slot),
                tick,
                last_access: now,
            },
        );
        self.order.insert(tick, partition_id.to_string());
        slot
    }

    fn remove_oldest(&mut self) -> Option<(String, Arc<Slot>)> {
        let (_, partition_id) = self.order.pop_first()?;
        let entry = self.entries.remove(&partition_id)?;
        Some((partition_id, entry.slot))
    }

    fn remove_slot(&mut self, partition_id: &str, slot: &Arc<Slot>) {
        let same = self
            .entries
            .get(partition_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot));
        if same {
            if let Some(entry) = self.entries.remove(partition_id) {
                self.order.remove(&entry.tick);
            }
        }
    }
}

/// LRU session cache bounded by entry count and idle time.
#[derive(Debug)]
pub(crate) struct SessionCache {
    max_size: usize,
    idle_secs: i64,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    pub fn new(max_size: usize, idle_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size: max_size.max(1),
            idle_secs,
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached session for `partition_id`, running `create` if the
    /// partition has none. At most one `create` runs per partition at a time.
    pub fn acquire<F>(&self, partition_id: &str, create: F) -> AsherahResult<Arc<Session>>
    where
        F: FnOnce() -> AsherahResult<Session>,
    {
        let now = self.clock.now_unix();
        let (slot, evicted) = {
            let mut inner = self.lock();
            let mut evicted = Vec::new();

            // Idle entries sit at the front of the access order.
            while let Some((_, oldest)) = inner.order.first_key_value() {
                let idle = inner
                    .entries
                    .get(oldest)
                    .is_some_and(|entry| now - entry.last_access >= self.idle_secs);
                if !idle {
                    break;
                }
                if let Some((id, slot)) = inner.remove_oldest() {
                    debug!("session for partition {id} expired after idling");
                    evicted.push(slot);
                }
            }

            let slot = inner.touch(partition_id, now);
            while inner.entries.len() > self.max_size {
                match inner.remove_oldest() {
                    Some((id, slot)) => {
                        debug!("evicted least recently used session for partition {id}");
                        evicted.push(slot);
                    }
                    None => break,
                }
            }
            (slot, evicted)
        };

        for old in evicted {
            old.close();
        }

        let seen = slot.attempts.load(Ordering::Acquire);
        let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.session.clone() {
            drop(state);
            return Ok(slot.release(session));
        }
        if slot.attempts.load(Ordering::Acquire) != seen {
            if let Some(err) = &state.last_error {
                return Err(err.duplicate());
            }
        }

        let result = create();
        slot.attempts.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok(session) => {
                let session = Arc::new(session);
                state.session = Some(Arc::clone(&session));
                state.last_error = None;
                drop(state);
                Ok(slot.release(session))
            }
            Err(err) => {
                state.last_error = Some(err.duplicate());
                drop(state);
                self.lock().remove_slot(partition_id, &slot);
                Err(err)
            }
        }
    }

    /// The cached session for `partition_id`, without deriving or touching it.
    pub fn get(&self, partition_id: &str) -> Option<Arc<Session>> {
        let slot = {
            let inner = self.lock();
            Arc::clone(&inner.entries.get(partition_id)?.slot)
        };
        let session = slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()?;
        Some(slot.release(session))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Removes every session and wipes its keys.
    pub fn close_all(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut inner = self.lock();
            inner.order.clear();
            inner.entries.drain().map(|(_, entry)| entry.slot).collect()
        };
        let count = slots.len();
        for slot in slots {
            slot.close();
        }
        if count > 0 {
            debug!("closed {count} cached sessions");
        }
    }
}
