//! Live observer fan-out
//!
//! Each observer owns a bounded channel. Broadcasting never waits: a full
//! or closed channel marks the observer dead and the sweep removes it.
//! A `Subscription` removes its observer when dropped, so an SSE client
//! that disconnects is cleaned up without waiting for the next sweep.
//! Closing the hub ends every stream, which lets graceful shutdown finish
//! while observers are still connected.

use crate::domain::{ExchangeRecord, MappingCode, ObserverId};
use crate::proxy::types::ProxyError;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Observer hub settings
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Messages buffered per observer before it is considered stalled
    pub channel_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Observers without a successful delivery for this long are removed
    pub inactivity_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

/// Message delivered to an observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum HubMessage {
    Connected,
    Heartbeat,
    Log(Arc<ExchangeRecord>),
}

impl HubMessage {
    /// Name used as the SSE event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::Log(_) => "log",
        }
    }
}

#[derive(Debug)]
struct Observer {
    filter: Option<MappingCode>,
    sender: mpsc::Sender<HubMessage>,
    connected_at: DateTime<Utc>,
    /// Milliseconds since the hub epoch
    last_activity: AtomicU64,
    alive: AtomicBool,
}

impl Observer {
    fn wants(&self, record: &ExchangeRecord) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|code| *code == record.mapping_code)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Snapshot of an observer for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverInfo {
    pub id: ObserverId,
    pub filter: Option<MappingCode>,
    pub connected_at: DateTime<Utc>,
    pub alive: bool,
}

/// Registry of live observers
#[derive(Debug)]
pub struct ObserverHub {
    observers: RwLock<HashMap<ObserverId, Arc<Observer>>>,
    config: ObserverConfig,
    epoch: Instant,
    closed: AtomicBool,
}

impl ObserverHub {
    pub fn new(config: ObserverConfig) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            config,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register an observer; `connected` is already queued on the returned
    /// stream
    ///
    /// After `close` the stream yields `connected` and then ends.
    pub fn subscribe(self: &Arc<Self>, filter: Option<MappingCode>) -> Subscription {
        let id = ObserverId::generate();
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));

        // Capacity is at least one and nothing else holds the sender yet
        let _ = sender.try_send(HubMessage::Connected);

        let subscription = Subscription {
            id,
            receiver,
            hub: Arc::downgrade(self),
        };

        if self.is_closed() {
            debug!(observer_id = %id, "Hub closed, observer not registered");
            return subscription;
        }

        let observer = Arc::new(Observer {
            filter,
            sender,
            connected_at: Utc::now(),
            last_activity: AtomicU64::new(self.millis_since_epoch(Instant::now())),
            alive: AtomicBool::new(true),
        });

        {
            let mut observers = self.observers.write();
            // Re-checked under the lock so a racing `close` cannot miss it
            if self.is_closed() {
                return subscription;
            }
            observers.insert(id, observer);
        }
        info!(observer_id = %id, "Observer connected");

        subscription
    }

    /// End every observer stream and refuse new registrations; returns the
    /// number of observers that were connected
    pub fn close(&self) -> usize {
        let removed = {
            let mut observers = self.observers.write();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *observers)
        };

        info!(closed = removed.len(), "Observer hub closed");
        removed.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver a record to every interested observer; returns the number of
    /// successful deliveries
    pub fn broadcast(&self, record: Arc<ExchangeRecord>) -> usize {
        let now = self.millis_since_epoch(Instant::now());
        let mut delivered = 0;
        let mut failures = 0;

        {
            let observers = self.observers.read();
            for (id, observer) in observers.iter() {
                if !observer.is_alive() || !observer.wants(&record) {
                    continue;
                }

                if Self::deliver(id, observer, HubMessage::Log(Arc::clone(&record)), now) {
                    delivered += 1;
                } else {
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            self.sweep();
        }

        delivered
    }

    /// Send a heartbeat to every live observer
    pub fn heartbeat(&self) -> usize {
        let now = self.millis_since_epoch(Instant::now());
        let observers = self.observers.read();

        observers
            .iter()
            .filter(|(_, observer)| observer.is_alive())
            .filter(|(id, observer)| Self::deliver(id, observer, HubMessage::Heartbeat, now))
            .count()
    }

    /// Remove dead and idle observers; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let now = self.millis_since_epoch(now);
        let idle_limit = u64::try_from(self.config.inactivity_timeout.as_millis()).unwrap_or(u64::MAX);

        let mut observers = self.observers.write();
        let before = observers.len();

        observers.retain(|id, observer| {
            let idle = now.saturating_sub(observer.last_activity.load(Ordering::Acquire));
            let keep = observer.is_alive() && idle <= idle_limit;
            if !keep {
                debug!(observer_id = %id, idle_ms = idle, "Removing observer");
            }
            keep
        });

        before - observers.len()
    }

    /// Idempotent removal
    pub fn remove(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().remove(&id).is_some();
        if removed {
            info!(observer_id = %id, "Observer disconnected");
        }
        removed
    }

    pub fn live_count(&self) -> usize {
        self.observers
            .read()
            .values()
            .filter(|observer| observer.is_alive())
            .count()
    }

    pub fn observers(&self) -> Vec<ObserverInfo> {
        self.observers
            .read()
            .iter()
            .map(|(id, observer)| ObserverInfo {
                id: *id,
                filter: observer.filter.clone(),
                connected_at: observer.connected_at,
                alive: observer.is_alive(),
            })
            .collect()
    }

    /// Heartbeat and sweep on a fixed interval until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = hub.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reached = hub.heartbeat();
                        let removed = hub.sweep();
                        debug!(reached, removed, "Observer maintenance tick");
                    }
                    _ = shutdown.changed() => {
                        info!("Observer maintenance stopping");
                        break;
                    }
                }
            }
        })
    }

    fn deliver(id: &ObserverId, observer: &Observer, message: HubMessage, now: u64) -> bool {
        match observer.sender.try_send(message) {
            Ok(()) => {
                observer.last_activity.store(now, Ordering::Release);
                true
            }
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "observer channel is full",
                    mpsc::error::TrySendError::Closed(_) => "observer channel is closed",
                };
                let error = ProxyError::BroadcastFailure(reason.to_string());
                debug!(observer_id = %id, error = %error, "Marking observer dead");
                observer.mark_dead();
                false
            }
        }
    }

    fn millis_since_epoch(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }
}

/// Message stream of one observer
pub struct Subscription {
    id: ObserverId,
    receiver: mpsc::Receiver<HubMessage>,
    hub: Weak<ObserverHub>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = HubMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
