//! In-process pub/sub keyed by `(domain, event)`.
//!
//! One registry per process. Handlers for the same key fire in subscription
//! order; a failing (or panicking) handler is logged and skipped, the rest of
//! the fan-out still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::{PeerId, TargetSpec};

/// What a listener receives.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub domain: String,
    pub event: String,
    /// Decoded payload.
    pub data: Value,
    /// Who sent it (`None` only for local sends before the first handshake).
    pub origin: Option<PeerId>,
    pub target: TargetSpec,
}

impl Delivery {
    /// Deserialize the payload into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| {
            RouteError::Handler(format!("{}.{} invalid data: {e}", self.domain, self.event))
        })
    }
}

pub type Handler = Arc<dyn Fn(&Delivery) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicKey {
    domain: String,
    event: String,
}

impl TopicKey {
    fn new(domain: &str, event: &str) -> Self {
        Self {
            domain: domain.to_string(),
            event: event.to_string(),
        }
    }
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    handler: Handler,
}

/// Local listener table.
#[derive(Default)]
pub struct DomainRegistry {
    topics: DashMap<TopicKey, Vec<Listener>>,
    seq: AtomicU64,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn subscribe(self: &Arc<Self>, domain: &str, event: &str, handler: Handler) -> Subscription {
        let id = ListenerId(self.seq.fetch_add(1, Ordering::Relaxed));
        let key = TopicKey::new(domain, event);
        self.topics
            .entry(key.clone())
            .or_insert_with(Vec::new)
            .push(Listener { id, handler });

        Subscription {
            registry: Arc::downgrade(self),
            key,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove one listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, domain: &str, event: &str, id: ListenerId) -> bool {
        self.remove(&TopicKey::new(domain, event), id)
    }

    fn remove(&self, key: &TopicKey, id: ListenerId) -> bool {
        let Some(mut listeners) = self.topics.get_mut(key) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            drop(listeners);
            self.topics.remove_if(key, |_, l| l.is_empty());
        }
        removed
    }

    pub fn listener_count(&self, domain: &str, event: &str) -> usize {
        self.topics
            .get(&TopicKey::new(domain, event))
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Fan a delivery out to every listener of its key.
    /// Returns how many handlers completed without error.
    pub fn publish(&self, delivery: &Delivery) -> usize {
        // Snapshot so handlers may (un)subscribe while we iterate.
        let listeners: Vec<Listener> = self
            .topics
            .get(&TopicKey::new(&delivery.domain, &delivery.event))
            .map(|l| l.value().clone())
            .unwrap_or_default();

        let mut ok = 0;
        for l in listeners {
            match catch_unwind(AssertUnwindSafe(|| (l.handler)(delivery))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        domain = %delivery.domain,
                        event = %delivery.event,
                        listener = l.id.0,
                        class = e.class().as_str(),
                        error = %e,
                        "handler failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        domain = %delivery.domain,
                        event = %delivery.event,
                        listener = l.id.0,
                        "handler panicked"
                    );
                }
            }
        }
        ok
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    registry: Weak<DomainRegistry>,
    key: TopicKey,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Idempotent: later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}
