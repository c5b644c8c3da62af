//! BroadcastHub - fan-out of dial messages to WebSocket consumers
//!
//! The hub owns the consumer registry. Each consumer gets a bounded FIFO queue of
//! [`Outbound`] frames which its socket task drains, so per-consumer ordering
//! always matches emission order. A consumer whose queue is full or closed is
//! evicted without affecting the others.
//!
//! Liveness: every heartbeat round clears each consumer's `alive` flag and
//! queues a ping. A pong sets the flag again. Consumers still not alive at the
//! next round are closed and removed.

pub mod ws;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::ButtonState;

/// Default per-consumer queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// The only message shapes sent to consumers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DialMessage {
    /// `{"button":"down"}` / `{"button":"up"}`
    Button { button: ButtonState },
    /// `{"degrees":1.5}`
    Rotation { degrees: f64 },
}

/// Frame queued for a single consumer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized JSON payload, shared between all consumers
    Text(Arc<str>),
    Ping,
    Close,
}

pub type ConsumerId = u64;

struct ConsumerConnection {
    token: String,
    alive: bool,
    tx: mpsc::Sender<Outbound>,
}

/// Returned by [`BroadcastHub::register`]; the socket task drains `rx`
pub struct ConsumerRegistration {
    pub id: ConsumerId,
    pub token: String,
    pub rx: mpsc::Receiver<Outbound>,
}

/// Result of one heartbeat round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub evicted: usize,
}

pub struct BroadcastHub {
    consumers: Mutex<HashMap<ConsumerId, ConsumerConnection>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

/// Shared hub wrapped in Arc for thread-safe sharing
pub type SharedHub = Arc<BroadcastHub>;

impl BroadcastHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    // The registry stays consistent across a panicking holder: every mutation
    // is a single insert/remove/flag write.
    fn registry(&self) -> MutexGuard<'_, HashMap<ConsumerId, ConsumerConnection>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a consumer. `token` identifies it in logs; a generated one is used when absent.
    pub fn register(&self, token: Option<String>) -> ConsumerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = token.unwrap_or_else(|| format!("consumer-{}", id));
        let (tx, rx) = mpsc::channel(self.queue_depth);

        let count = {
            let mut consumers = self.registry();
            consumers.insert(
                id,
                ConsumerConnection {
                    token: token.clone(),
                    alive: true,
                    tx,
                },
            );
            consumers.len()
        };

        debug!("client connected: {} ({} total)", token, count);
        ConsumerRegistration { id, token, rx }
    }

    /// Record a heartbeat acknowledgment. Returns false for unknown consumers.
    pub fn acknowledge(&self, id: ConsumerId) -> bool {
        match self.registry().get_mut(&id) {
            Some(consumer) => {
                trace!("client pong received: {}", consumer.token);
                consumer.alive = true;
                true
            }
            None => false,
        }
    }

    /// Remove a consumer whose socket has gone away
    pub fn remove(&self, id: ConsumerId) -> bool {
        let removed = self.registry().remove(&id);
        match removed {
            Some(consumer) => {
                debug!("client disconnected: {}", consumer.token);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize `message` once and queue it for every registered consumer.
    ///
    /// Returns the number of consumers the message was queued for. Consumers
    /// whose queue rejects the frame are evicted.
    pub fn send(&self, message: &DialMessage) -> usize {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Failed to serialize {:?}: {}", message, e);
                return 0;
            }
        };
        debug!("> {}", payload);

        let mut delivered = 0;
        let mut evicted = Vec::new();
        {
            let mut consumers = self.registry();
            consumers.retain(|_, consumer| {
                match consumer.tx.try_send(Outbound::Text(payload.clone())) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(e) => {
                        evicted.push((consumer.token.clone(), e.to_string()));
                        false
                    }
                }
            });
        }

        for (token, reason) in evicted {
            warn!("Evicting client {}: {}", token, reason);
        }
        delivered
    }

    /// Run one liveness round: evict consumers that never acknowledged the
    /// previous ping, then ping everyone else.
    pub fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut unresponsive = Vec::new();
        {
            let mut consumers = self.registry();
            consumers.retain(|_, consumer| {
                if !consumer.alive {
                    if consumer.tx.try_send(Outbound::Close).is_err() {
                        trace!("close frame not queued for {}", consumer.token);
                    }
                    unresponsive.push(consumer.token.clone());
                    return false;
                }

                consumer.alive = false;
                match consumer.tx.try_send(Outbound::Ping) {
                    Ok(()) => {
                        report.pinged += 1;
                        true
                    }
                    Err(_) => {
                        unresponsive.push(consumer.token.clone());
                        false
                    }
                }
            });
        }

        report.evicted = unresponsive.len();
        for token in unresponsive {
            debug!("client did not respond to ping: {}", token);
        }
        trace!(
            "heartbeat: pinged {}, evicted {}",
            report.pinged,
            report.evicted
        );
        report
    }

    /// Close and remove every consumer
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConsumerConnection> =
            self.registry().drain().map(|(_, consumer)| consumer).collect();

        for consumer in &drained {
            if consumer.tx.try_send(Outbound::Close).is_err() {
                trace!("close frame not queued for {}", consumer.token);
            }
        }
        drained.len()
    }

    /// Drive [`heartbeat`](Self::heartbeat) every `interval` until `shutdown`
    /// fires, then close all consumers.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        // The first round happens one full interval after startup
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Heartbeat started ({:?} interval)", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat();
                }
            }
        }

        let closed = self.close_all();
        info!("Heartbeat stopped, closed {} client(s)", closed);
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

/// Create a new shared hub
pub fn create_hub(queue_depth: usize) -> SharedHub {
    Arc::new(BroadcastHub::new(queue_depth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(rx: &mut mpsc::Receiver<Outbound>) -> Option<String> {
        match rx.try_recv() {
            Ok(Outbound::Text(payload)) => Some(payload.to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_wire_format() {
        let down = DialMessage::Button {
            button: ButtonState::Down,
        };
        let up = DialMessage::Button {
            button: ButtonState::Up,
        };
        let turn = DialMessage::Rotation { degrees: 1.0 };
        let back = DialMessage::Rotation { degrees: -7.5 };

        assert_eq!(serde_json::to_string(&down).unwrap(), r#"{"button":"down"}"#);
        assert_eq!(serde_json::to_string(&up).unwrap(), r#"{"button":"up"}"#);
        assert_eq!(serde_json::to_string(&turn).unwrap(), r#"{"degrees":1.0}"#);
        assert_eq!(serde_json::to_string(&back).unwrap(), r#"{"degrees":-7.5}"#);
    }

    #[test]
    fn test_register_assigns_ids_and_tokens() {
        let hub = BroadcastHub::default();
        let a = hub.register(Some("dGhlIHNhbXBsZSBub25jZQ==".to_string()));
        let b = hub.register(None);

        assert_ne!(a.id, b.id);
        assert_eq!(a.token, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(b.token, format!("consumer-{}", b.id));
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_fanout_to_all_consumers() {
        let hub = BroadcastHub::default();
        let mut consumers: Vec<_> = (0..3).map(|_| hub.register(None)).collect();

        let delivered = hub.send(&DialMessage::Rotation { degrees: 2.5 });
        assert_eq!(delivered, 3);

        for consumer in &mut consumers {
            assert_eq!(text(&mut consumer.rx).as_deref(), Some(r#"{"degrees":2.5}"#));
        }
    }

    #[test]
    fn test_send_preserves_order() {
        let hub = BroadcastHub::default();
        let mut consumer = hub.register(None);

        assert_eq!(
            hub.send(&DialMessage::Button {
                button: ButtonState::Down
            }),
            1
        );
        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 3.0 }), 1);
        assert_eq!(
            hub.send(&DialMessage::Button {
                button: ButtonState::Up
            }),
            1
        );

        assert_eq!(text(&mut consumer.rx).as_deref(), Some(r#"{"button":"down"}"#));
        assert_eq!(text(&mut consumer.rx).as_deref(), Some(r#"{"degrees":3.0}"#));
        assert_eq!(text(&mut consumer.rx).as_deref(), Some(r#"{"button":"up"}"#));
    }

    #[test]
    fn test_send_with_no_consumers() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 1.0 }), 0);
    }

    #[test]
    fn test_closed_consumer_is_evicted_without_affecting_others() {
        let hub = BroadcastHub::default();
        let mut kept = hub.register(None);
        let dropped = hub.register(None);
        drop(dropped.rx);

        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 1.0 }), 1);
        assert_eq!(hub.len(), 1);
        assert!(text(&mut kept.rx).is_some());
    }

    #[test]
    fn test_full_queue_evicts_consumer() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.register(None);

        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 1.0 }), 1);
        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 2.0 }), 0);
        assert!(hub.is_empty());

        // The frame queued before eviction is still delivered, then the queue ends
        assert_eq!(text(&mut slow.rx).as_deref(), Some(r#"{"degrees":1.0}"#));
        assert!(matches!(
            slow.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_heartbeat_evicts_unresponsive_consumer() {
        let hub = BroadcastHub::default();
        let mut a = hub.register(None);
        let mut b = hub.register(None);
        let mut silent = hub.register(None);

        let first = hub.heartbeat();
        assert_eq!(first, HeartbeatReport { pinged: 3, evicted: 0 });
        for consumer in [&mut a, &mut b, &mut silent] {
            assert_eq!(consumer.rx.try_recv().unwrap(), Outbound::Ping);
        }

        assert!(hub.acknowledge(a.id));
        assert!(hub.acknowledge(b.id));

        let second = hub.heartbeat();
        assert_eq!(second, HeartbeatReport { pinged: 2, evicted: 1 });
        assert_eq!(hub.len(), 2);

        assert_eq!(silent.rx.try_recv().unwrap(), Outbound::Close);
        assert!(matches!(
            silent.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // Remaining consumers keep receiving
        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 4.0 }), 2);
        assert_eq!(a.rx.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(text(&mut a.rx).as_deref(), Some(r#"{"degrees":4.0}"#));
        assert_eq!(b.rx.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(text(&mut b.rx).as_deref(), Some(r#"{"degrees":4.0}"#));
    }

    #[test]
    fn test_broadcast_reaches_consumer_awaiting_pong() {
        let hub = BroadcastHub::default();
        let mut consumer = hub.register(None);

        hub.heartbeat();
        assert_eq!(hub.send(&DialMessage::Rotation { degrees: 1.0 }), 1);
        assert_eq!(consumer.rx.try_recv().unwrap(), Outbound::Ping);
        assert!(text(&mut consumer.rx).is_some());
    }

    #[test]
    fn test_acknowledge_and_remove_unknown() {
        let hub = BroadcastHub::default();
        assert!(!hub.acknowledge(42));
        assert!(!hub.remove(42));

        let consumer = hub.register(None);
        assert!(hub.remove(consumer.id));
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_run_heartbeat_closes_consumers_on_shutdown() {
        let hub = create_hub(DEFAULT_QUEUE_DEPTH);
        let mut consumer = hub.register(None);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(
            hub.clone()
                .run_heartbeat(Duration::from_secs(30), shutdown.clone()),
        );
        shutdown.cancel();
        task.await.unwrap();

        assert!(hub.is_empty());
        assert_eq!(consumer.rx.recv().await, Some(Outbound::Close));
        assert_eq!(consumer.rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_heartbeat_evicts_after_two_silent_rounds() {
        let hub = create_hub(DEFAULT_QUEUE_DEPTH);
        let mut consumer = hub.register(None);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(
            hub.clone()
                .run_heartbeat(Duration::from_secs(30), shutdown.clone()),
        );

        assert_eq!(consumer.rx.recv().await, Some(Outbound::Ping));
        assert_eq!(consumer.rx.recv().await, Some(Outbound::Close));
        assert_eq!(consumer.rx.recv().await, None);
        assert!(hub.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
