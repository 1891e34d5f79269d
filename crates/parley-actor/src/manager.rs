// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide actor registry and the single bus listener.
//!
//! Exactly one subscriber task multiplexes every topic channel; subscription
//! is channel-shared, so agents on the same topic reuse one subscription and
//! the channel is only dropped when its last agent leaves.  On transport
//! failure the subscriber is rebuilt with the current channel set and the
//! loop resumes; a read timeout just polls again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_bus::{
    parse_event, topic_channel, topic_id_from_channel, BusMessage, BusSubscriber, EventBus,
    MANAGER_EVENTS,
};
use parley_store::MessageRecord;

use crate::behavior::{ActorDeps, AgentBehavior, EngineConfig};
use crate::engine::{ActorEngine, ActorHandle, ActorStatus};

enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

struct ManagerShared {
    deps: ActorDeps,
    bus: Arc<dyn EventBus>,
    config: EngineConfig,
    actors: Mutex<HashMap<String, ActorHandle>>,
    /// channel → agent ids subscribed through it
    channels: Mutex<HashMap<String, Vec<String>>>,
    listener: Mutex<Option<mpsc::UnboundedSender<SubCommand>>>,
}

/// Registry of live actors plus the global subscriber.  Clones share state.
#[derive(Clone)]
pub struct ActorManager {
    shared: Arc<ManagerShared>,
}

impl ActorManager {
    pub fn new(deps: ActorDeps, bus: Arc<dyn EventBus>, config: EngineConfig) -> Self {
        info!("actor manager initialized");
        Self {
            shared: Arc::new(ManagerShared {
                deps,
                bus,
                config,
                actors: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    // ─── Actor lifecycle ─────────────────────────────────────────────────────

    pub fn get_or_create_actor(
        &self,
        agent_id: &str,
        behavior: Arc<dyn AgentBehavior>,
    ) -> ActorHandle {
        let mut actors = self.shared.actors.lock().unwrap();
        if let Some(handle) = actors.get(agent_id) {
            if handle.is_running() {
                return handle.clone();
            }
        }
        let handle = ActorEngine::spawn(
            agent_id,
            behavior,
            self.shared.deps.clone(),
            self.shared.config.clone(),
        );
        info!(agent_id, "actor created");
        actors.insert(agent_id.to_string(), handle.clone());
        handle
    }

    pub fn get_actor(&self, agent_id: &str) -> Option<ActorHandle> {
        self.shared.actors.lock().unwrap().get(agent_id).cloned()
    }

    /// Activate (or refresh) an agent on a topic, optionally feeding it a
    /// trigger message to process immediately.
    pub async fn activate_agent(
        &self,
        agent_id: &str,
        topic_id: &str,
        trigger: Option<MessageRecord>,
        behavior: Arc<dyn AgentBehavior>,
    ) -> ActorHandle {
        let handle = self.get_or_create_actor(agent_id, behavior);
        self.subscribe_for_agent(agent_id, &topic_channel(topic_id));
        handle.activate(topic_id, trigger, None);
        handle
    }

    pub fn remove_actor(&self, agent_id: &str) {
        let handle = self.shared.actors.lock().unwrap().remove(agent_id);
        if let Some(handle) = handle {
            handle.stop();
            info!(agent_id, "actor removed");
        }
        // Drop the agent from every channel it was attached to.
        let channels: Vec<String> = {
            let channels = self.shared.channels.lock().unwrap();
            channels
                .iter()
                .filter(|(_, agents)| agents.iter().any(|a| a == agent_id))
                .map(|(ch, _)| ch.clone())
                .collect()
        };
        for channel in channels {
            self.unsubscribe_for_agent(agent_id, &channel);
        }
    }

    // ─── Subscription bookkeeping ────────────────────────────────────────────

    /// Attach an agent to a channel.  The underlying subscription is created
    /// only for the channel's first agent.
    pub fn subscribe_for_agent(&self, agent_id: &str, channel: &str) {
        let newly_subscribed = {
            let mut channels = self.shared.channels.lock().unwrap();
            let agents = channels.entry(channel.to_string()).or_default();
            let new_channel = agents.is_empty();
            if !agents.iter().any(|a| a == agent_id) {
                agents.push(agent_id.to_string());
                debug!(agent_id, channel, "agent attached to channel");
            }
            new_channel
        };
        let listener = self.ensure_listener();
        if newly_subscribed {
            let _ = listener.send(SubCommand::Subscribe(channel.to_string()));
            info!(channel = %channel, "channel subscribed");
        }
    }

    /// Detach an agent; unsubscribes the channel only when its agent list
    /// becomes empty.
    pub fn unsubscribe_for_agent(&self, agent_id: &str, channel: &str) {
        let drop_channel = {
            let mut channels = self.shared.channels.lock().unwrap();
            let Some(agents) = channels.get_mut(channel) else { return };
            agents.retain(|a| a != agent_id);
            if agents.is_empty() {
                channels.remove(channel);
                true
            } else {
                false
            }
        };
        if drop_channel {
            if let Some(listener) = self.shared.listener.lock().unwrap().as_ref() {
                let _ = listener.send(SubCommand::Unsubscribe(channel.to_string()));
            }
            info!(channel = %channel, "channel unsubscribed");
        }
    }

    fn ensure_listener(&self) -> mpsc::UnboundedSender<SubCommand> {
        let mut listener = self.shared.listener.lock().unwrap();
        if let Some(tx) = listener.as_ref() {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_listener(Arc::clone(&self.shared), rx));
        *listener = Some(tx.clone());
        tx
    }

    // ─── Monitoring ──────────────────────────────────────────────────────────

    pub fn get_active_agents(&self) -> Vec<String> {
        self.shared.actors.lock().unwrap().keys().cloned().collect()
    }

    /// Status of every activated actor (running with a bound topic).
    pub fn get_pool_status(&self) -> Vec<ActorStatus> {
        self.shared
            .actors
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.is_running())
            .map(|h| h.status())
            .filter(|s| !s.topic_id.is_empty())
            .collect()
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────

    pub fn shutdown(&self) {
        let actors: Vec<ActorHandle> = {
            let mut actors = self.shared.actors.lock().unwrap();
            actors.drain().map(|(_, h)| h).collect()
        };
        for handle in actors {
            handle.stop();
        }
        self.shared.channels.lock().unwrap().clear();
        if let Some(listener) = self.shared.listener.lock().unwrap().take() {
            let _ = listener.send(SubCommand::Shutdown);
        }
        info!("actor manager shutdown complete");
    }
}

// ─── Global listener ──────────────────────────────────────────────────────────

async fn run_listener(
    shared: Arc<ManagerShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<SubCommand>,
) {
    let mut subscriber = match open_with_retry(&shared).await {
        Some(sub) => sub,
        None => return,
    };
    info!("global bus listener started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(SubCommand::Shutdown) => break,
                Some(SubCommand::Subscribe(channel)) => {
                    if let Err(e) = subscriber.subscribe(&channel).await {
                        warn!(channel = %channel, error = %e, "subscribe failed, rebuilding listener");
                        rebuild(&shared, &mut subscriber).await;
                    }
                }
                Some(SubCommand::Unsubscribe(channel)) => {
                    let _ = subscriber.unsubscribe(&channel).await;
                }
            },
            msg = subscriber.next_message() => match msg {
                // Read timeout: just poll again.
                Ok(None) => {}
                Ok(Some(msg)) => dispatch(&shared, msg),
                Err(e) => {
                    error!(error = %e, "listener transport failed, rebuilding");
                    rebuild(&shared, &mut subscriber).await;
                }
            },
        }
    }
    info!("global bus listener stopped");
}

async fn open_with_retry(shared: &Arc<ManagerShared>) -> Option<Box<dyn BusSubscriber>> {
    loop {
        match shared.bus.open_subscriber().await {
            Ok(sub) => return Some(sub),
            Err(e) => {
                error!(error = %e, "cannot open bus subscriber, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Re-create the subscription with the current channel set.  No messages are
/// consumed while reconnecting; delivery is at-most-once by contract.
async fn rebuild(shared: &Arc<ManagerShared>, subscriber: &mut Box<dyn BusSubscriber>) {
    loop {
        let Some(mut fresh) = open_with_retry(shared).await else { return };
        let channels: Vec<String> = shared
            .channels
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        let mut ok = true;
        for channel in &channels {
            if let Err(e) = fresh.subscribe(channel).await {
                warn!(channel = %channel, error = %e, "resubscribe failed");
                ok = false;
                break;
            }
        }
        if ok {
            *subscriber = fresh;
            info!(channels = channels.len(), "listener rebuilt and resubscribed");
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Route one delivery into every mailbox attached to its channel.  Unknown
/// event types were already dropped by the parser; UI-only events are not
/// dispatched to actors.
fn dispatch(shared: &Arc<ManagerShared>, msg: BusMessage) {
    let Some(event) = parse_event(&msg.payload) else { return };
    if !MANAGER_EVENTS.contains(&event.event_type) {
        return;
    }
    let agents: Vec<String> = shared
        .channels
        .lock()
        .unwrap()
        .get(&msg.channel)
        .cloned()
        .unwrap_or_default();
    if agents.is_empty() {
        return;
    }
    debug!(
        channel = %msg.channel,
        event = event.event_type.as_str(),
        fanout = agents.len(),
        "dispatching bus event"
    );
    let topic_id = topic_id_from_channel(&msg.channel).to_string();
    let actors = shared.actors.lock().unwrap();
    for agent_id in agents {
        if let Some(handle) = actors.get(&agent_id) {
            handle.on_event(&topic_id, &event);
        }
    }
}
