//! Single-flight coordination
//!
//! At most one background operation runs per key. The first caller spawns it;
//! callers arriving while it is in flight join it and receive a clone of the
//! same outcome. Each entry counts its waiters and is removed when the last
//! one has taken the result (or given up). The mutex guards only the
//! in-flight map, never the work itself.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use tracing::{debug, error};

struct InFlight<V: Clone> {
    outcome: Shared<BoxFuture<'static, V>>,
    waiters: usize,
}

/// In-flight operations keyed by operand
pub struct SingleFlight<K, V: Clone> {
    name: &'static str,
    inflight: Mutex<HashMap<K, InFlight<V>>>,
}

/// Releases one waiter's claim on an entry, even if the waiter is dropped
struct Waiter<'a, K: Eq + Hash, V: Clone> {
    flight: &'a SingleFlight<K, V>,
    key: K,
}

impl<K: Eq + Hash, V: Clone> Drop for Waiter<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.flight.inflight.lock();
        if let Some(entry) = inflight.get_mut(&self.key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                inflight.remove(&self.key);
            }
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Default + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `start()` for `key` unless an operation for it is already in flight.
    ///
    /// The work is spawned onto the runtime, so it completes even if every
    /// waiter goes away. A panicking operation resolves to `V::default()`.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let outcome = {
            let mut inflight = self.inflight.lock();
            match inflight.get_mut(&key) {
                Some(entry) => {
                    entry.waiters += 1;
                    debug!("Joining in-flight {} for {:?} ({} waiters)", self.name, key, entry.waiters);
                    entry.outcome.clone()
                }
                None => {
                    let name = self.name;
                    let label = format!("{:?}", key);
                    let handle = tokio::spawn(start());
                    let outcome = async move {
                        match handle.await {
                            Ok(value) => value,
                            Err(e) => {
                                error!("Background {} for {} failed: {}", name, label, e);
                                V::default()
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        key.clone(),
                        InFlight {
                            outcome: outcome.clone(),
                            waiters: 1,
                        },
                    );
                    outcome
                }
            }
        };

        let _waiter = Waiter { flight: self, key };
        outcome.await
    }

    /// Whether an operation for `key` is in flight
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Callers currently waiting on `key`
    pub fn waiters(&self, key: &K) -> usize {
        self.inflight.lock().get(key).map_or(0, |e| e.waiters)
    }
}
