// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Topic fan-out bus.
//!
//! Every topic has one pub/sub channel (`topic:<id>`).  The Redis adapter is
//! the production transport; the in-memory bus backs tests and single-process
//! runs.  Delivery is at-most-once: consumers must tolerate missed events
//! (state-carrying events are idempotent or also present in the message
//! store).

mod bus;
mod event;
mod kv;
mod redis_bus;

pub use bus::{BusMessage, BusSubscriber, EventBus, MemoryBus};
pub use event::{
    interrupt_key, make_envelope, parse_event, topic_channel, topic_id_from_channel, EventType,
    ParsedEvent, MANAGER_EVENTS,
};
pub use kv::{KeyValueStore, MemoryKv, RedisKv};
pub use redis_bus::RedisBus;
