//! Aggregation of external traffic intents between uploads.
//!
//! DNS observations go straight into the `immediate` map and are returned
//! by the next drain.  IP observations are parked in `delayed` for one
//! drain cycle first, so a consumer learns which name resolved to an
//! address before it sees bare traffic to that address.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::trace;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::{age, Clock, SystemClock};
use crate::types::{ExternalTrafficKey, Intent, TimestampedIntent, TrafficIntent};

/// Entries older than this are never admitted, returned or promoted.
pub const INTENT_TTL: Duration = Duration::from_secs(60 * 60);

fn is_expired(now: SystemTime, timestamp: SystemTime) -> bool {
    age(now, timestamp) >= INTENT_TTL
}

/// Decides which client namespaces are not reported at all.
pub trait NamespaceFilter: Send + Sync {
    fn is_excluded(&self, namespace: &str) -> bool;
}

/// Fixed set of excluded namespaces, usually built from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedNamespaces(HashSet<String>);

impl ExcludedNamespaces {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(namespaces.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl NamespaceFilter for ExcludedNamespaces {
    fn is_excluded(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }
}

/// Receives every non-empty batch produced by the periodic upload loop.
///
/// Failures are the callback's own business: nothing is retried and the
/// loop does not look at any outcome.
#[async_trait]
pub trait IntentsCallback: Send + Sync {
    async fn notify(&self, cancel: &CancellationToken, intents: &[TimestampedIntent]);
}

#[async_trait]
impl<F> IntentsCallback for F
where
    F: Fn(&CancellationToken, &[TimestampedIntent]) + Send + Sync,
{
    async fn notify(&self, cancel: &CancellationToken, intents: &[TimestampedIntent]) {
        (self)(cancel, intents)
    }
}

/// Number of entries waiting in each map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub immediate: usize,
    pub delayed: usize,
}

#[derive(Debug, Default)]
struct Buckets {
    immediate: HashMap<ExternalTrafficKey, TimestampedIntent>,
    delayed: HashMap<ExternalTrafficKey, TimestampedIntent>,
}

/// Thread-safe holder collecting intents between periodic uploads.
///
/// Both maps sit behind a single lock so a drain rotates them atomically
/// with respect to concurrent inserts.
pub struct IntentsHolder {
    buckets: Mutex<Buckets>,
    callbacks: Mutex<Vec<Arc<dyn IntentsCallback>>>,
    excluded: Arc<dyn NamespaceFilter>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for IntentsHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentsHolder")
            .field("pending", &self.pending_counts())
            .field("callbacks", &self.callbacks.lock().len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl IntentsHolder {
    pub fn new(excluded: Arc<dyn NamespaceFilter>) -> Self {
        Self::with_clock(excluded, Arc::new(SystemClock))
    }

    pub fn with_clock(excluded: Arc<dyn NamespaceFilter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            callbacks: Mutex::new(Vec::new()),
            excluded,
            clock,
        }
    }

    /// Registers a callback for every future non-empty batch.
    ///
    /// Safe to call while the upload loop runs; the callback is picked up
    /// on the next tick.
    pub fn register_notify_intents<C>(&self, callback: C)
    where
        C: IntentsCallback + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Snapshot of the registered callbacks, in registration order.
    pub(crate) fn callbacks(&self) -> Vec<Arc<dyn IntentsCallback>> {
        self.callbacks.lock().clone()
    }

    /// Records one observation, merging it with an existing entry for the
    /// same key.  Observations from excluded namespaces and observations
    /// already past [`INTENT_TTL`] are dropped without notice.
    pub fn add_intent(&self, intent: impl Into<Intent>) {
        let intent = intent.into();
        if self.excluded.is_excluded(&intent.client().namespace) {
            trace!("Dropping intent from excluded namespace: {}", intent.client());
            return;
        }

        let mut buckets = self.buckets.lock();

        let last_seen = intent.last_seen();
        if is_expired(self.clock.now(), last_seen) {
            trace!("Dropping stale intent from {}", intent.client());
            return;
        }

        let key = intent.key();
        match intent {
            Intent::Dns(dns) => match buckets.immediate.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(TimestampedIntent::new(Intent::Dns(dns)));
                }
                Entry::Occupied(mut slot) => {
                    let merged = slot.get_mut();
                    merged.observe(last_seen);
                    match &mut merged.intent {
                        Intent::Dns(existing) => existing.ips.extend(dns.ips),
                        Intent::Ip(_) => {
                            unreachable!("DNS key for {} holds an IP intent", dns.dns_name)
                        }
                    }
                }
            },
            Intent::Ip(ip) => match buckets.delayed.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(TimestampedIntent::new(Intent::Ip(ip)));
                }
                Entry::Occupied(mut slot) => slot.get_mut().observe(last_seen),
            },
        }
    }

    /// Returns every unexpired entry ready for delivery, then promotes the
    /// entries parked since the previous call so the next call returns them.
    ///
    /// Ready entries stay in place and are returned again by later calls
    /// until they expire.  The order of the returned entries is unspecified.
    pub fn get_new_intents_since_last_get(&self) -> Vec<TimestampedIntent> {
        let mut guard = self.buckets.lock();
        let now = self.clock.now();
        let Buckets { immediate, delayed } = &mut *guard;

        let mut intents = Vec::with_capacity(immediate.len());
        immediate.retain(|_, entry| {
            if is_expired(now, entry.timestamp) {
                return false;
            }
            intents.push(entry.clone());
            true
        });

        delayed.retain(|_, entry| !is_expired(now, entry.timestamp));

        for (key, entry) in std::mem::take(delayed) {
            match immediate.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                Entry::Occupied(mut slot) => {
                    if entry.timestamp > slot.get().timestamp {
                        slot.insert(entry);
                    }
                }
            }
        }

        intents
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let buckets = self.buckets.lock();
        PendingCounts {
            immediate: buckets.immediate.len(),
            delayed: buckets.delayed.len(),
        }
    }
}
