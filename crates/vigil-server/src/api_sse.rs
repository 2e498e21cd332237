//! SSE notification transport.
//!
//! Each subscriber id owns a broadcast channel. The engine delivers into it
//! through [`SseHub`]'s [`Transport`] impl and `GET /events/{subscriber_id}`
//! streams it out. Deliveries for subscribers without an open stream are
//! dropped; the subscribe response carries the snapshot a reconnecting
//! client starts from.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    response::{sse::Event, Sse},
};
use futures_util::Stream;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use vigil_engine::Transport;
use vigil_types::NotificationMessage;

/// Messages buffered per subscriber before a slow stream starts lagging.
pub const SSE_BUFFER: usize = 256;

type Sender = broadcast::Sender<Arc<NotificationMessage>>;

/// Fan-out point between the engine and open SSE streams.
#[derive(Debug)]
pub struct SseHub {
    channels: RwLock<HashMap<String, Sender>>,
    capacity: usize,
}

impl SseHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Opens a receiver for `subscriber_id`, creating its channel if needed.
    pub fn subscribe(&self, subscriber_id: &str) -> broadcast::Receiver<Arc<NotificationMessage>> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(subscriber_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of open streams for `subscriber_id`.
    pub fn connected(&self, subscriber_id: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, subscriber_id: &str) -> Option<Sender> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber_id)
            .cloned()
    }

    fn prune(&self, subscriber_id: &str) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(subscriber_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(subscriber_id);
        }
    }
}

impl Transport for SseHub {
    fn deliver(&self, subscriber_id: &str, messages: Vec<Arc<NotificationMessage>>) {
        let Some(tx) = self.sender(subscriber_id) else {
            tracing::debug!(subscriber_id, count = messages.len(), "no open stream, notifications dropped");
            return;
        };
        for message in messages {
            if tx.send(message).is_err() {
                tracing::debug!(subscriber_id, "stream closed, notifications dropped");
                self.prune(subscriber_id);
                return;
            }
        }
    }
}

/// Handler for `GET /events/{subscriber_id}`.
///
/// Streams the subscriber's notifications. The SSE event name is the message
/// type and the event id its sequence number.
pub async fn get_event_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscriber_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!(subscriber_id = %subscriber_id, "notification stream opened");
    let stream = BroadcastStream::new(state.hub.subscribe(&subscriber_id));

    let mapped_stream = stream.filter_map(move |result| match result {
        Ok(message) => match serde_json::to_string(&*message) {
            Ok(data) => Some(Ok(Event::default()
                .event(message.kind.as_str())
                .id(message.seq.to_string())
                .data(data))),
            Err(e) => {
                tracing::error!("failed to serialize notification: {}", e);
                None
            }
        },
        Err(lagged) => {
            tracing::warn!(
                subscriber_id = %subscriber_id,
                error = %lagged,
                "notification stream lagged; messages were dropped for this subscriber"
            );
            None
        }
    });

    Sse::new(mapped_stream).keep_alive(axum::response::sse::KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{ChangeSet, Fingerprint, ItemChange, NotificationKind};

    fn burst(subscriber_id: &str) -> Vec<Arc<NotificationMessage>> {
        let changes = ChangeSet {
            added: vec![ItemChange {
                id: "1".into(),
                position: 0,
                data: serde_json::json!({"id": 1}),
            }],
            removed: vec!["2".into()],
            ..ChangeSet::default()
        };
        NotificationMessage::burst(&Fingerprint::from_hex("ab".repeat(32)), subscriber_id, 3, "id", &changes)
            .into_iter()
            .map(Arc::new)
            .collect()
    }

    #[tokio::test]
    async fn delivers_in_order_to_open_streams() {
        let hub = SseHub::new(8);
        let mut rx = hub.subscribe("sub-1");
        assert_eq!(hub.connected("sub-1"), 1);

        hub.deliver("sub-1", burst("sub-1"));
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Added);
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Removed);
    }

    #[test]
    fn drops_without_stream_and_prunes_closed_channels() {
        let hub = SseHub::new(8);
        hub.deliver("nobody", burst("nobody"));
        assert_eq!(hub.connected("nobody"), 0);

        let rx = hub.subscribe("sub-1");
        drop(rx);
        hub.deliver("sub-1", burst("sub-1"));
        assert!(hub.sender("sub-1").is_none());
    }
}
