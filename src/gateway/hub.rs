//! Subscription fan-out.
//!
//! The hub owns every subscribed client connection exclusively. Each
//! subscriber gets a bounded queue drained by its own writer task, so a
//! slow consumer never blocks the publishing thread or its peers; on
//! overflow the frame is dropped for that subscriber only, keeping
//! delivery an ordered subsequence of the published values.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::data::{Value, VarId};
use crate::core::error::Result;
use crate::store::DataCache;

/// Frames buffered per subscriber before pushes start being dropped.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

struct SubscriberHandle {
    tx: mpsc::Sender<String>,
}

/// Per-variable subscriber registry with push fan-out.
pub struct SubscriptionHub {
    cache: Arc<DataCache>,
    subscribers: DashMap<VarId, Vec<SubscriberHandle>>,
}

impl SubscriptionHub {
    /// Create a hub backed by `cache` for id validation.
    pub fn new(cache: Arc<DataCache>) -> Self {
        Self {
            cache,
            subscribers: DashMap::new(),
        }
    }

    /// Take exclusive ownership of `stream` as a subscriber of `id`.
    ///
    /// If `id` is unknown to the cache, replies with a JSON error and
    /// closes the connection instead.
    pub async fn subscribe(&self, id: VarId, mut stream: TcpStream) -> Result<()> {
        if !self.cache.exists(id) {
            stream
                .write_all(b"{\"error\": \"Unknown variable ID\"}\n")
                .await?;
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        tokio::spawn(subscriber_writer(stream, rx));
        self.subscribers
            .entry(id)
            .or_default()
            .push(SubscriberHandle { tx });

        info!(id, "new subscription");
        Ok(())
    }

    /// Push an update for `id` to every live subscriber.
    ///
    /// Non-blocking: frames are enqueued with `try_send`. Subscribers whose
    /// writer task has exited are dropped here; full queues cost that
    /// subscriber this frame only.
    pub fn publish(&self, id: VarId, name: &str, value: &Value) {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return;
        };

        let frame = serde_json::json!({
            "i": id,
            "n": name,
            "v": value.to_json(),
            "t": Utc::now().timestamp_millis(),
            "type": "data_update",
        })
        .to_string()
            + "\n";

        entry.retain(|sub| match sub.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id, "subscriber backlog full, dropping push frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(id, "subscriber disconnected, dropping");
                false
            }
        });
    }

    /// Remove subscribers whose connection has gone away.
    pub fn reap(&self) {
        self.subscribers.retain(|id, subs| {
            let before = subs.len();
            subs.retain(|sub| !sub.tx.is_closed());
            if subs.len() < before {
                debug!(id, removed = before - subs.len(), "reaped subscribers");
            }
            !subs.is_empty()
        });
    }

    /// Drop every subscription, closing the underlying sockets.
    ///
    /// Writer tasks exit when their queue sender goes away.
    pub fn shutdown(&self) {
        self.subscribers.clear();
    }

    /// Total live subscriptions across all variables.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.len()).sum()
    }
}

/// Writer task owning one subscriber socket.
///
/// Drains the frame queue into the socket and watches the read side for
/// EOF so closed clients are detected even when no pushes are flowing.
async fn subscriber_writer(stream: TcpStream, mut rx: mpsc::Receiver<String>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut discard = [0_u8; 64];

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            read = reader.read(&mut discard) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }
}
