// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One delivery from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish side plus subscriber construction.  A process normally opens
/// exactly one subscriber (the actor manager's global listener).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Open a fresh subscriber with an empty channel set.  Called again to
    /// rebuild after a transport failure.
    async fn open_subscriber(&self) -> anyhow::Result<Box<dyn BusSubscriber>>;
}

/// A single pub/sub subscription multiplexing many channels.
#[async_trait]
pub trait BusSubscriber: Send {
    async fn subscribe(&mut self, channel: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&mut self, channel: &str) -> anyhow::Result<()>;

    /// Wait for the next delivery.  `Ok(None)` is a benign read timeout — the
    /// caller just polls again.  `Err` means the transport broke and the
    /// subscriber must be rebuilt.
    async fn next_message(&mut self) -> anyhow::Result<Option<BusMessage>>;
}

// ─── In-memory bus ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryBusInner {
    /// subscriber id → (subscribed channels, delivery queue)
    subscribers: HashMap<u64, (HashSet<String>, mpsc::UnboundedSender<BusMessage>)>,
}

/// Process-local bus for tests and single-node runs.  Same at-most-once
/// semantics as Redis pub/sub: messages published while nobody is subscribed
/// are dropped.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryBusInner>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let inner = self.inner.lock().unwrap();
        for (channels, tx) in inner.subscribers.values() {
            if channels.contains(channel) {
                // A closed queue means the subscriber is gone; ignore.
                let _ = tx.send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn open_subscriber(&self) -> anyhow::Result<Box<dyn BusSubscriber>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .insert(id, (HashSet::new(), tx));
        Ok(Box::new(MemorySubscriber {
            id,
            inner: Arc::clone(&self.inner),
            rx,
        }))
    }
}

struct MemorySubscriber {
    id: u64,
    inner: Arc<Mutex<MemoryBusInner>>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl BusSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> anyhow::Result<()> {
        if let Some((channels, _)) = self.inner.lock().unwrap().subscribers.get_mut(&self.id) {
            channels.insert(channel.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> anyhow::Result<()> {
        if let Some((channels, _)) = self.inner.lock().unwrap().subscribers.get_mut(&self.id) {
            channels.remove(channel);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> anyhow::Result<Option<BusMessage>> {
        // Bounded wait so the owning loop stays responsive to shutdown, same
        // as the Redis subscriber's read timeout.
        match tokio::time::timeout(std::time::Duration::from_secs(1), self.rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => anyhow::bail!("memory bus closed"),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.inner.lock().unwrap().subscribers.remove(&self.id);
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_only_subscribed_channels() {
        let bus = MemoryBus::new();
        let mut sub = bus.open_subscriber().await.unwrap();
        sub.subscribe("topic:a").await.unwrap();

        bus.publish("topic:a", "one").await.unwrap();
        bus.publish("topic:b", "two").await.unwrap();

        let msg = sub.next_message().await.unwrap().unwrap();
        assert_eq!(msg.channel, "topic:a");
        assert_eq!(msg.payload, "one");
        // topic:b must never arrive
        assert!(sub.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::new();
        bus.publish("topic:a", "lost").await.unwrap();
        let mut sub = bus.open_subscriber().await.unwrap();
        sub.subscribe("topic:a").await.unwrap();
        assert!(sub.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let mut sub = bus.open_subscriber().await.unwrap();
        sub.subscribe("topic:a").await.unwrap();
        sub.unsubscribe("topic:a").await.unwrap();
        bus.publish("topic:a", "x").await.unwrap();
        assert!(sub.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_subscription_fans_out_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut s1 = bus.open_subscriber().await.unwrap();
        let mut s2 = bus.open_subscriber().await.unwrap();
        s1.subscribe("topic:a").await.unwrap();
        s2.subscribe("topic:a").await.unwrap();
        bus.publish("topic:a", "x").await.unwrap();
        assert!(s1.next_message().await.unwrap().is_some());
        assert!(s2.next_message().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_removed() {
        let bus = MemoryBus::new();
        {
            let mut sub = bus.open_subscriber().await.unwrap();
            sub.subscribe("topic:a").await.unwrap();
        }
        // Publishing after the subscriber is gone must not error.
        bus.publish("topic:a", "x").await.unwrap();
        assert!(bus.inner.lock().unwrap().subscribers.is_empty());
    }
}
