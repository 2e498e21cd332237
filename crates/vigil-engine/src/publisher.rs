//! Notification publisher and the transport seam.
//!
//! The publisher turns a change set into per-subscriber message bursts and
//! hands them to a [`Transport`]. Messages are wrapped in `Arc` before the
//! hand-off, so no recipient can affect what another recipient sees.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use vigil_types::{ChangeSet, Fingerprint, NotificationMessage};

use crate::stats::EngineStats;

/// Delivers notification messages to subscribers.
///
/// Implementations must not block for long: `deliver` is called from
/// evaluation workers. Delivery failures are the transport's concern.
pub trait Transport: Send + Sync + 'static {
    /// Hands an ordered batch of messages for one subscriber.
    fn deliver(&self, subscriber_id: &str, messages: Vec<Arc<NotificationMessage>>);
}

/// One `deliver` call, as seen by a [`ChannelTransport`] receiver.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscriber_id: String,
    pub messages: Vec<Arc<NotificationMessage>>,
}

/// Transport that forwards every delivery into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn deliver(&self, subscriber_id: &str, messages: Vec<Arc<NotificationMessage>>) {
        let delivery = Delivery {
            subscriber_id: subscriber_id.to_string(),
            messages,
        };
        if self.tx.send(delivery).is_err() {
            tracing::debug!(subscriber_id, "delivery receiver dropped");
        }
    }
}

type Buffer = BTreeMap<String, Vec<Arc<NotificationMessage>>>;

/// Fans change sets out to subscribers.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    /// Pending bursts per subscriber when batching is on.
    batch: Option<Mutex<Buffer>>,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("batching", &self.batch.is_some())
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Creates a publisher. With `batching`, messages are buffered until
    /// [`Publisher::flush`] runs, see [`flush_task`].
    pub fn new(transport: Arc<dyn Transport>, batching: bool, stats: Arc<EngineStats>) -> Self {
        Self {
            transport,
            batch: batching.then(|| Mutex::new(Buffer::new())),
            stats,
        }
    }

    pub fn is_batching(&self) -> bool {
        self.batch.is_some()
    }

    /// Publishes `changes` to each recipient. Returns the number of messages.
    pub fn publish(
        &self,
        fingerprint: &Fingerprint,
        seq: u64,
        primary_key: &str,
        changes: &ChangeSet,
        recipients: &[String],
    ) -> usize {
        let mut sent = 0;
        for subscriber_id in recipients {
            let burst: Vec<Arc<NotificationMessage>> =
                NotificationMessage::burst(fingerprint, subscriber_id, seq, primary_key, changes)
                    .into_iter()
                    .map(Arc::new)
                    .collect();
            sent += burst.len();
            self.hand_off(subscriber_id, burst);
        }
        self.stats.add_notifications(sent as u64);
        sent
    }

    /// Sends one `error` message to each recipient.
    pub fn publish_error(
        &self,
        fingerprint: &Fingerprint,
        seq: u64,
        primary_key: &str,
        message: &str,
        recipients: &[String],
    ) -> usize {
        for subscriber_id in recipients {
            let msg = NotificationMessage::error(fingerprint, subscriber_id, seq, primary_key, message);
            self.hand_off(subscriber_id, vec![Arc::new(msg)]);
        }
        self.stats.add_notifications(recipients.len() as u64);
        recipients.len()
    }

    fn lock_batch<'a>(&self, batch: &'a Mutex<Buffer>) -> MutexGuard<'a, Buffer> {
        batch.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!("publisher batch lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn hand_off(&self, subscriber_id: &str, messages: Vec<Arc<NotificationMessage>>) {
        if messages.is_empty() {
            return;
        }
        match &self.batch {
            Some(batch) => self
                .lock_batch(batch)
                .entry(subscriber_id.to_string())
                .or_default()
                .extend(messages),
            None => self.transport.deliver(subscriber_id, messages),
        }
    }

    /// Delivers every buffered burst, one transport call per subscriber.
    /// Returns the number of subscribers served.
    pub fn flush(&self) -> usize {
        let Some(batch) = &self.batch else {
            return 0;
        };
        let pending = std::mem::take(&mut *self.lock_batch(batch));
        let served = pending.len();
        for (subscriber_id, messages) in pending {
            self.transport.deliver(&subscriber_id, messages);
        }
        served
    }
}

/// Flushes a batching publisher every `window`.
pub async fn flush_task(publisher: Arc<Publisher>, window: Duration) {
    if !publisher.is_batching() || window.is_zero() {
        return;
    }
    tracing::info!(window_ms = window.as_millis() as u64, "notification batching enabled");

    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let served = publisher.flush();
        if served > 0 {
            tracing::debug!(subscribers = served, "flushed notification batch");
        }
    }
}
