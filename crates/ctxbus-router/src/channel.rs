//! Named event channels: the surface collaborators actually use.
//!
//! An [`EventChannel`] is bound to one `(domain, event)` pair and to the
//! process's dispatcher (hub or connector). It can be paused; paused sends are
//! buffered per target and replayed on resume, optionally through a reducer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde_json::Value;

use ctxbus_core::error::Result;
use ctxbus_core::target::{FOCUSED_ONLY, LOCAL_ONLY, VISIBLE_ONLY};
use ctxbus_core::{Environment, PeerId, TabId, TargetFlags, TargetSpec};

use crate::dispatch::Dispatch;
use crate::registry::{Delivery, Subscription};

/// Buffered values per target, keys kept in first-buffered order.
#[derive(Default)]
struct PausedQueue {
    keys: Vec<(TargetSpec, Vec<Value>)>,
}

impl PausedQueue {
    fn push(&mut self, target: TargetSpec, data: Value) {
        match self.keys.iter_mut().find(|(t, _)| *t == target) {
            Some((_, values)) => values.push(data),
            None => self.keys.push((target, vec![data])),
        }
    }

    fn len(&self) -> usize {
        self.keys.iter().map(|(_, v)| v.len()).sum()
    }
}

struct Paused {
    epoch: u64,
    queue: PausedQueue,
}

pub struct EventChannel {
    domain: String,
    event: String,
    dispatcher: Arc<dyn Dispatch>,
    paused: Mutex<Option<Paused>>,
    epochs: AtomicU64,
}

impl EventChannel {
    pub fn new(domain: &str, event: &str, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            domain: domain.to_string(),
            event: event.to_string(),
            dispatcher,
            paused: Mutex::new(None),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    fn lock_paused(&self) -> MutexGuard<'_, Option<Paused>> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire-and-forget send. Errors are configuration or codec failures only;
    /// delivery itself is never acknowledged.
    pub async fn send(&self, target: TargetSpec, data: Value) -> Result<()> {
        {
            let mut paused = self.lock_paused();
            if let Some(p) = paused.as_mut() {
                p.queue.push(target, data);
                return Ok(());
            }
        }
        self.dispatcher.dispatch(&self.domain, &self.event, target, data).await
    }

    pub async fn send_to_peer(&self, peer_id: PeerId, data: Value) -> Result<()> {
        self.send(TargetSpec::Peer(peer_id), data).await
    }

    pub async fn send_to_tab(&self, tab_id: TabId, data: Value) -> Result<()> {
        self.send(TargetSpec::Tab(tab_id), data).await
    }

    pub async fn send_to_hub(&self, data: Value) -> Result<()> {
        self.send(TargetSpec::Flags(TargetFlags::of(Environment::HUB, 0)?), data).await
    }

    pub async fn send_to_satellites(&self, data: Value) -> Result<()> {
        self.send(TargetSpec::Flags(TargetFlags::of(Environment::SATELLITE, 0)?), data)
            .await
    }

    pub async fn send_to_focused(&self, data: Value) -> Result<()> {
        self.send(TargetSpec::flags(FOCUSED_ONLY)?, data).await
    }

    pub async fn send_to_visible(&self, data: Value) -> Result<()> {
        self.send(TargetSpec::flags(VISIBLE_ONLY)?, data).await
    }

    /// Only this process's listeners.
    pub async fn send_local(&self, data: Value) -> Result<()> {
        self.send(TargetSpec::flags(LOCAL_ONLY)?, data).await
    }

    /// Raw mask; rejected before anything is sent if the combination is invalid.
    pub async fn broadcast(&self, mask: u32, data: Value) -> Result<()> {
        self.send(TargetSpec::flags(mask)?, data).await
    }

    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Delivery) -> Result<()> + Send + Sync + 'static,
    {
        self.dispatcher
            .registry()
            .subscribe(&self.domain, &self.event, Arc::new(handler))
    }

    pub fn off(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    pub fn is_paused(&self) -> bool {
        self.lock_paused().is_some()
    }

    pub fn buffered(&self) -> usize {
        self.lock_paused().as_ref().map(|p| p.queue.len()).unwrap_or(0)
    }

    /// Start buffering sends. Pausing an already paused channel returns a
    /// handle to the same pause.
    pub fn pause(self: &Arc<Self>) -> Resume {
        let mut paused = self.lock_paused();
        let epoch = match paused.as_ref() {
            Some(p) => p.epoch,
            None => {
                let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
                *paused = Some(Paused {
                    epoch,
                    queue: PausedQueue::default(),
                });
                epoch
            }
        };
        Resume {
            channel: Arc::clone(self),
            epoch,
        }
    }

    /// Detach the queue if `epoch` is still the active pause.
    fn take_paused(&self, epoch: u64) -> Option<PausedQueue> {
        let mut paused = self.lock_paused();
        match paused.as_ref() {
            Some(p) if p.epoch == epoch => paused.take().map(|p| p.queue),
            _ => None,
        }
    }
}

/// Handle returned by [`EventChannel::pause`].
pub struct Resume {
    channel: Arc<EventChannel>,
    epoch: u64,
}

impl Resume {
    /// Replay everything buffered, unchanged.
    pub async fn resume(&self) {
        self.resume_with(|values| values).await
    }

    /// Replay each target's buffer through `reducer`. Later calls (on this or
    /// any other handle of the same pause) do nothing.
    pub async fn resume_with<F>(&self, mut reducer: F)
    where
        F: FnMut(Vec<Value>) -> Vec<Value>,
    {
        let Some(queue) = self.channel.take_paused(self.epoch) else {
            return;
        };
        for (target, values) in queue.keys {
            for data in reducer(values) {
                let sent = self
                    .channel
                    .dispatcher
                    .dispatch(&self.channel.domain, &self.channel.event, target, data)
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(
                        domain = %self.channel.domain,
                        event = %self.channel.event,
                        class = e.class().as_str(),
                        error = %e,
                        "buffered send failed"
                    );
                }
            }
        }
    }
}

/// Per-domain, lazily populated set of event channels.
pub struct Channels {
    domain: String,
    dispatcher: Arc<dyn Dispatch>,
    channels: DashMap<String, Arc<EventChannel>>,
}

impl Channels {
    pub fn new(domain: &str, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            domain: domain.to_string(),
            dispatcher,
            channels: DashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The channel for `event`, created on first use.
    pub fn channel(&self, event: &str) -> Arc<EventChannel> {
        self.channels
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(EventChannel::new(&self.domain, event, self.dispatcher.clone())))
            .clone()
    }
}
