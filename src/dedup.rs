//! Collapsing of concurrent identical calls.
//!
//! The first call for a key becomes the leader: its work is spawned onto the runtime and registered as in flight.
//! Calls arriving with the same key while it runs join it and receive a clone of the very same result, success or
//! failure. The registration is dropped by the spawned task right after the work settles, before anybody observes the
//! result, so a later call starts afresh.

use futures_util::future::BoxFuture;
use futures_util::future::Shared;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::CacheError;
use crate::error::Result;

pub type InFlight = Shared<BoxFuture<'static, Result<Value>>>;

type InFlightMap = Arc<Mutex<HashMap<String, (u64, InFlight)>>>;

// Unregisters a call when its task finishes, panics included.
struct Registration {
    registry:   InFlightMap,
    key:        String,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut in_flight = self.registry.lock();
        if in_flight.get(&self.key).is_some_and(|(g, _)| *g == self.generation) {
            in_flight.remove(&self.key);
        }
    }
}

#[derive(Default)]
pub struct Deduplicator {
    in_flight:  InFlightMap,
    generation: AtomicU64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the call in flight for `key`, or start `work` and register it under the key.
    ///
    /// `work` is only invoked when there is nothing to join.
    pub fn run<W, Fut>(&self, key: String, label: &str, work: W) -> InFlight
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();

        if let Some((_, shared)) = in_flight.get(&key) {
            log::trace!("Joining in-flight call of {label}");
            return shared.clone();
        }

        let registration = Registration {
            registry:   Arc::clone(&self.in_flight),
            key:        key.clone(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };
        let generation = registration.generation;
        let fut = work();

        // The lock is held until the entry is inserted, therefore the cleanup can't run ahead of the registration.
        let task = tokio::spawn(async move {
            let _registration = registration;
            fut.await
        });

        let function = label.to_string();
        let shared = async move {
            task.await.unwrap_or_else(|err| {
                Err(CacheError::Aborted {
                    function,
                    message: err.to_string(),
                })
            })
        }
        .boxed()
        .shared();

        in_flight.insert(key, (generation, shared.clone()));
        shared
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}
