//! In-memory response cache with single-flight computation.
//!
//! The map holds either a finished entry or an in-flight marker. The marker
//! is inserted in the same critical section that misses, so concurrent
//! callers for one key observe exactly one of: a fresh value, the marker, or
//! nothing. Whoever inserts the marker spawns the builder as a detached
//! task; every caller, the originator included, then awaits the marker's
//! watch channel. The originator being cancelled therefore never kills a
//! computation other callers are waiting on.
//!
//! Failures clear the slot and are delivered to all waiters; nothing
//! negative is ever cached. Expired entries are evicted lazily on read, with
//! `sweep` available for a periodic pass to bound memory.

use crate::error::ClipError;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Derive the cache key for a call: SHA-256 over the qualified name and the
/// canonicalized (key-sorted) argument object, hex encoded.
pub fn cache_key(qualified: &str, args: &Map<String, Value>) -> String {
    let canonical = canonicalize_json(&Value::Object(args.clone()));
    let mut hasher = Sha256::new();
    hasher.update(qualified.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Sort object keys recursively so logically equal argument objects
/// serialize identically. Arrays keep their order; scalars (floats included)
/// take serde_json's canonical formatting.
fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut out = Map::with_capacity(entries.len());
            for (key, child) in entries {
                out.insert(key.clone(), canonicalize_json(child));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

type BuildOutcome<V> = Option<Result<V, ClipError>>;

enum Slot<V> {
    Ready { value: V, expires_at: Instant },
    InFlight(watch::Receiver<BuildOutcome<V>>),
}

pub struct ResponseCache<V> {
    slots: Arc<Mutex<HashMap<String, Slot<V>>>>,
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<V> Default for ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

enum Plan<V> {
    Hit(V),
    Wait(watch::Receiver<BuildOutcome<V>>),
    Build {
        tx: watch::Sender<BuildOutcome<V>>,
        rx: watch::Receiver<BuildOutcome<V>>,
    },
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(slots: &Mutex<HashMap<String, Slot<V>>>) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        match slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Return the cached value for `key`, or run `build` to produce it.
    ///
    /// The boolean is true when the value was served from a finished cache
    /// entry; participants of an in-flight computation all get false.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        build: F,
    ) -> Result<(V, bool), ClipError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ClipError>> + Send + 'static,
    {
        let plan = {
            let mut slots = Self::lock(&self.slots);
            let now = Instant::now();
            let expired = matches!(
                slots.get(key),
                Some(Slot::Ready { expires_at, .. }) if *expires_at <= now
            );
            if expired {
                slots.remove(key);
            }
            match slots.get(key) {
                Some(Slot::Ready { value, .. }) => Plan::Hit(value.clone()),
                Some(Slot::InFlight(rx)) => Plan::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.to_string(), Slot::InFlight(rx.clone()));
                    Plan::Build { tx, rx }
                }
            }
        };

        match plan {
            Plan::Hit(value) => Ok((value, true)),
            Plan::Wait(rx) => Ok((Self::await_outcome(rx).await?, false)),
            Plan::Build { tx, rx } => {
                let fut = build();
                let slots = Arc::clone(&self.slots);
                let key = key.to_string();
                tokio::spawn(async move {
                    let result = fut.await;
                    {
                        let mut slots = Self::lock(&slots);
                        match &result {
                            Ok(value) => {
                                slots.insert(
                                    key,
                                    Slot::Ready {
                                        value: value.clone(),
                                        expires_at: Instant::now() + ttl,
                                    },
                                );
                            }
                            Err(_) => {
                                slots.remove(&key);
                            }
                        }
                    }
                    let _ = tx.send(Some(result));
                });
                Ok((Self::await_outcome(rx).await?, false))
            }
        }
    }

    async fn await_outcome(mut rx: watch::Receiver<BuildOutcome<V>>) -> Result<V, ClipError> {
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            if rx.changed().await.is_err() {
                return Err(ClipError::Cache("builder task dropped".into()));
            }
        }
    }

    /// Evict expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut slots = Self::lock(&self.slots);
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight(_) => true,
        });
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
