// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Redis transport: pub/sub fan-out plus managed-connection commands.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::bus::{BusMessage, BusSubscriber, EventBus};

/// Redis-backed bus.  Publishing goes through a [`ConnectionManager`] (auto
/// reconnecting); each subscriber owns a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("redis connection failed")?;
        Ok(Self { client, conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .with_context(|| format!("publish to {channel} failed"))?;
        Ok(())
    }

    async fn open_subscriber(&self) -> anyhow::Result<Box<dyn BusSubscriber>> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("redis pubsub connection failed")?;
        debug!("opened redis pubsub subscriber");
        Ok(Box::new(RedisSubscriber { pubsub }))
    }
}

struct RedisSubscriber {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl BusSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> anyhow::Result<()> {
        self.pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("subscribe {channel} failed"))
    }

    async fn unsubscribe(&mut self, channel: &str) -> anyhow::Result<()> {
        self.pubsub
            .unsubscribe(channel)
            .await
            .with_context(|| format!("unsubscribe {channel} failed"))
    }

    async fn next_message(&mut self) -> anyhow::Result<Option<BusMessage>> {
        // Short read timeout: the owning loop interleaves channel-set changes
        // and shutdown checks between polls.
        let mut stream = self.pubsub.on_message();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next());
        match next.await {
            Err(_) => Ok(None),
            Ok(None) => anyhow::bail!("redis pubsub stream closed"),
            Ok(Some(msg)) => {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg
                    .get_payload()
                    .context("non-utf8 pubsub payload")?;
                Ok(Some(BusMessage { channel, payload }))
            }
        }
    }
}
