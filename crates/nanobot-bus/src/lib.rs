//! `nanobot-bus` — bounded message queues decoupling chat channels from the
//! agent core.
//!
//! Channels publish to `inbound`; the agent consumes it, does its work, and
//! publishes replies to `outbound`. A dispatcher task fans outbound messages
//! out to per-channel subscriber callbacks, each spawned as its own task with
//! a hard delivery timeout so one slow channel cannot stall the others.
//!
//! Publishing never blocks forever: when a queue is still full at the
//! deadline the message is dropped with a logged warning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use nanobot_core::types::{InboundMessage, OutboundMessage};

/// Per-channel delivery callback. Must be cheap to clone (Arc).
pub type OutboundCallback =
    Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hard cap on a single outbound delivery.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    subscribers: RwLock<HashMap<String, Vec<OutboundCallback>>>,
    max_size: usize,
}

impl MessageBus {
    pub fn new(max_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(max_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(max_size);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            subscribers: RwLock::new(HashMap::new()),
            max_size,
        }
    }

    /// Publish a message from a channel to the agent.
    /// Returns false (and logs) if the queue was still full at the deadline.
    pub async fn publish_inbound(&self, msg: InboundMessage, timeout: Duration) -> bool {
        let channel = msg.channel.clone();
        match self.inbound_tx.send_timeout(msg, timeout).await {
            Ok(()) => true,
            Err(_) => {
                warn!(channel = %channel, "inbound queue full, dropped message");
                false
            }
        }
    }

    /// Consume the next inbound message. Returns `None` only when every
    /// publisher handle has been dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Publish a reply from the agent toward the channels.
    pub async fn publish_outbound(&self, msg: OutboundMessage, timeout: Duration) -> bool {
        let channel = msg.channel.clone();
        match self.outbound_tx.send_timeout(msg, timeout).await {
            Ok(()) => true,
            Err(_) => {
                warn!(channel = %channel, "outbound queue full, dropped message");
                false
            }
        }
    }

    /// Register a delivery callback for one channel name.
    pub fn subscribe_outbound(&self, channel: &str, callback: OutboundCallback) {
        self.subscribers
            .write()
            .expect("bus subscriber table poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(callback);
    }

    /// Fan outbound messages out to subscribers. Run as a background task;
    /// exits when the outbound queue closes.
    ///
    /// Each callback runs as an independent task so a slow channel only
    /// delays its own deliveries.
    pub async fn dispatch_outbound(self: Arc<Self>) {
        loop {
            let msg = {
                let mut rx = self.outbound_rx.lock().await;
                match rx.recv().await {
                    Some(m) => m,
                    None => break,
                }
            };
            let callbacks: Vec<OutboundCallback> = {
                let subs = self
                    .subscribers
                    .read()
                    .expect("bus subscriber table poisoned");
                subs.get(&msg.channel).cloned().unwrap_or_default()
            };
            for callback in callbacks {
                let msg = msg.clone();
                tokio::spawn(async move {
                    let channel = msg.channel.clone();
                    match tokio::time::timeout(DISPATCH_TIMEOUT, callback(msg)).await {
                        Ok(()) => {}
                        Err(_) => {
                            error!(channel = %channel, "outbound dispatch timed out after 60s");
                        }
                    }
                });
            }
        }
    }

    /// Number of pending inbound messages.
    pub fn inbound_size(&self) -> usize {
        self.max_size - self.inbound_tx.capacity()
    }

    /// Number of pending outbound messages.
    pub fn outbound_size(&self) -> usize {
        self.max_size - self.outbound_tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_and_consume_inbound() {
        let bus = MessageBus::new(4);
        let msg = InboundMessage::new("cli", "user", "direct", "hello");
        assert!(bus.publish_inbound(msg, Duration::from_millis(100)).await);
        assert_eq!(bus.inbound_size(), 1);

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "hello");
        assert_eq!(bus.inbound_size(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = MessageBus::new(1);
        let ok = bus
            .publish_inbound(
                InboundMessage::new("cli", "u", "c", "first"),
                Duration::from_millis(50),
            )
            .await;
        assert!(ok);
        let dropped = bus
            .publish_inbound(
                InboundMessage::new("cli", "u", "c", "second"),
                Duration::from_millis(50),
            )
            .await;
        assert!(!dropped);
    }

    #[tokio::test]
    async fn dispatcher_routes_by_channel() {
        let bus = Arc::new(MessageBus::new(8));
        let delivered = Arc::new(AtomicUsize::new(0));

        let count = delivered.clone();
        bus.subscribe_outbound(
            "telegram",
            Arc::new(move |_msg| {
                let count = count.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let dispatcher = tokio::spawn(bus.clone().dispatch_outbound());

        bus.publish_outbound(
            OutboundMessage::new("telegram", "42", "hi"),
            Duration::from_millis(100),
        )
        .await;
        bus.publish_outbound(
            OutboundMessage::new("discord", "99", "ignored"),
            Duration::from_millis(100),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        dispatcher.abort();
    }
}
