// Artifact broker: channel registry, fan-out and late-subscriber queues
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, Scope};
use crate::config::BrokerConfig;
use crate::endpoint::{Endpoint, EndpointId, EndpointSender};
use crate::{Result, TabulaError};

/// Per-channel counters, readable without a round trip through the broker task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_queued: u64,
    pub total_replayed: u64,
    pub dropped_artifacts: u64,
    pub active_subscribers: usize,
    pub pending: usize,
}

/// Point-in-time view of the routing tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerSnapshot {
    /// channel -> identities of registered endpoints (sorted)
    pub channels: BTreeMap<String, Vec<String>>,
    /// channel -> number of artifacts waiting for a first subscriber
    pub pending: BTreeMap<String, usize>,
}

impl BrokerSnapshot {
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    pub fn pending_depth(&self, channel: &str) -> usize {
        self.pending.get(channel).copied().unwrap_or(0)
    }
}

/// Everything the broker task consumes, in intake order.
#[derive(Debug)]
enum Inbound {
    /// Posted straight to the broker, optionally transferring an endpoint.
    Post {
        artifact: Artifact,
        port: Option<Endpoint>,
    },
    /// Arrived on a registered endpoint.
    FromEndpoint { from: EndpointId, artifact: Artifact },
    /// The component side of a registered endpoint went away.
    EndpointClosed { id: EndpointId },
    Inspect(oneshot::Sender<BrokerSnapshot>),
    Shutdown,
}

/// Cloneable handle for posting to a running broker.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    inlet: mpsc::UnboundedSender<Inbound>,
}

impl BrokerClient {
    /// Posts an artifact to the broker inlet.
    ///
    /// A `register` artifact must carry the endpoint being transferred;
    /// anything else is routed as if it came from an unregistered sender.
    pub fn post(&self, artifact: Artifact, port: Option<Endpoint>) -> Result<()> {
        self.inlet
            .send(Inbound::Post { artifact, port })
            .map_err(|_| TabulaError::BrokerUnavailable("broker inlet closed".into()))
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inlet
            .send(Inbound::Inspect(tx))
            .map_err(|_| TabulaError::BrokerUnavailable("broker inlet closed".into()))?;
        rx.await
            .map_err(|_| TabulaError::BrokerUnavailable("broker stopped before replying".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.inlet.is_closed()
    }
}

/// The running broker.
///
/// Owns the task that holds every channel registration and pending queue.
/// Dropping it without calling [`Broker::shutdown`] still stops the task.
pub struct Broker {
    client: BrokerClient,
    stats: Arc<DashMap<String, ChannelStats>>,
    task: Option<JoinHandle<BrokerSnapshot>>,
}

impl Broker {
    /// Starts the broker task on the current tokio runtime.
    pub fn spawn(config: BrokerConfig) -> Self {
        let (inlet, intake) = mpsc::unbounded_channel();
        let stats = Arc::new(DashMap::new());
        let state = BrokerState {
            config,
            inlet: inlet.clone(),
            channels: HashMap::new(),
            endpoints: HashMap::new(),
            pending: HashMap::new(),
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(state.run(intake));
        info!(target: "broker", "Broker started");
        Self {
            client: BrokerClient { inlet },
            stats,
            task: Some(task),
        }
    }

    pub fn client(&self) -> BrokerClient {
        self.client.clone()
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot> {
        self.client.snapshot().await
    }

    /// Get stats
    pub fn stats(&self, channel: &str) -> Option<ChannelStats> {
        self.stats.get(channel).map(|s| s.clone())
    }

    /// Stops the broker after everything already posted has been processed
    /// and returns the final routing tables.
    pub async fn shutdown(mut self) -> Result<BrokerSnapshot> {
        info!(target: "broker", "Broker shutting down");
        let Some(task) = self.task.take() else {
            return Ok(BrokerSnapshot::default());
        };
        // the task may already be gone; the join below reports that
        let _ = self.client.inlet.send(Inbound::Shutdown);
        task.await
            .map_err(|e| TabulaError::BrokerUnavailable(format!("broker task failed: {e}")))
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            let _ = self.client.inlet.send(Inbound::Shutdown);
        }
    }
}

struct Registered {
    identity: String,
    sender: EndpointSender,
    pump: JoinHandle<()>,
}

struct Pending {
    artifact: Artifact,
    queued_at: Instant,
}

struct BrokerState {
    config: BrokerConfig,
    // handed to endpoint pumps
    inlet: mpsc::UnboundedSender<Inbound>,
    // channel -> endpoint -> registration
    channels: HashMap<String, HashMap<EndpointId, Registered>>,
    // endpoint -> channel it registered on
    endpoints: HashMap<EndpointId, String>,
    pending: HashMap<String, VecDeque<Pending>>,
    stats: Arc<DashMap<String, ChannelStats>>,
}

impl BrokerState {
    async fn run(mut self, mut intake: mpsc::UnboundedReceiver<Inbound>) -> BrokerSnapshot {
        while let Some(msg) = intake.recv().await {
            match msg {
                Inbound::Post { artifact, port } => self.on_post(artifact, port),
                Inbound::FromEndpoint { from, artifact } => {
                    if artifact.scope == Scope::Register {
                        warn!(target: "broker", endpoint = %from, channel = %artifact.channel,
                            "Register artifact arrived without an endpoint; dropped");
                        continue;
                    }
                    self.forward(Some(from), artifact);
                }
                Inbound::EndpointClosed { id } => self.remove_endpoint(id, "endpoint closed"),
                Inbound::Inspect(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Inbound::Shutdown => break,
            }
        }
        let snapshot = self.snapshot();
        for reg in self.channels.values().flat_map(|subs| subs.values()) {
            reg.pump.abort();
        }
        info!(target: "broker", channels = snapshot.channels.len(), "Broker stopped");
        snapshot
    }

    fn on_post(&mut self, artifact: Artifact, port: Option<Endpoint>) {
        match (artifact.scope, port) {
            (Scope::Register, Some(port)) => self.register(artifact, port),
            (Scope::Register, None) => {
                warn!(target: "broker", identity = %artifact.identity, channel = %artifact.channel,
                    "Register artifact arrived without an endpoint; dropped");
            }
            (_, port) => {
                if let Some(port) = port {
                    debug!(target: "broker", endpoint = %port.id(),
                        "Endpoint attached to a non-register artifact; ignored");
                }
                self.forward(None, artifact);
            }
        }
    }

    fn register(&mut self, artifact: Artifact, port: Endpoint) {
        let id = port.id();
        let channel = artifact.channel;
        let identity = artifact.identity;
        let (sender, mut receiver) = port.into_split();

        if sender.is_closed() {
            warn!(target: "broker", endpoint = %id, channel = %channel, identity = %identity,
                "Endpoint closed before registration; pending artifacts kept");
            return;
        }

        // Replay anything that arrived before the first subscriber, minus the
        // registrant's own artifacts. The queue is gone once replay completes.
        if let Some(mut queue) = self.pending.remove(&channel) {
            self.expire(&channel, &mut queue);
            let mut replayed = 0u64;
            let mut skipped = VecDeque::new();
            while let Some(p) = queue.pop_front() {
                if p.artifact.identity == identity {
                    skipped.push_back(p);
                    continue;
                }
                let queued_at = p.queued_at;
                if let Err(artifact) = sender.deliver(p.artifact) {
                    // undelivered artifacts go back in their original order
                    skipped.push_back(Pending { artifact, queued_at });
                    skipped.append(&mut queue);
                    let depth = skipped.len();
                    self.pending.insert(channel.clone(), skipped);
                    warn!(target: "broker", endpoint = %id, channel = %channel, depth,
                        "Endpoint closed during replay; registration abandoned");
                    self.update_stats(&channel, |s| {
                        s.total_replayed += replayed;
                        s.pending = depth;
                    });
                    return;
                }
                replayed += 1;
            }
            let skipped = skipped.len();
            debug!(target: "broker", channel = %channel, identity = %identity, replayed, skipped,
                "Replayed pending artifacts");
            self.update_stats(&channel, |s| {
                s.total_replayed += replayed;
                s.pending = 0;
            });
        }

        let inlet = self.inlet.clone();
        let pump = tokio::spawn(async move {
            while let Some(artifact) = receiver.recv().await {
                if inlet
                    .send(Inbound::FromEndpoint { from: id, artifact })
                    .is_err()
                {
                    return;
                }
            }
            let _ = inlet.send(Inbound::EndpointClosed { id });
        });

        let subscribers = self.channels.entry(channel.clone()).or_default();
        subscribers.insert(
            id,
            Registered {
                identity: identity.clone(),
                sender,
                pump,
            },
        );
        let total = subscribers.len();
        self.endpoints.insert(id, channel.clone());
        self.update_stats(&channel, |s| s.active_subscribers = total);

        info!(target: "broker", channel = %channel, identity = %identity, endpoint = %id,
            total, "Endpoint registered");
    }

    fn forward(&mut self, from: Option<EndpointId>, artifact: Artifact) {
        let channel = artifact.channel.clone();
        self.update_stats(&channel, |s| s.total_published += 1);

        let Some(subscribers) = self.channels.get(&channel) else {
            self.enqueue(artifact);
            return;
        };

        let mut delivered = 0u64;
        let mut dead = Vec::new();
        for (id, reg) in subscribers {
            if Some(*id) == from {
                continue;
            }
            match reg.sender.send(artifact.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(*id),
            }
        }
        debug!(target: "broker", id = %artifact.id, channel = %channel, topic = %artifact.topic,
            delivered, "Forwarded artifact");
        self.update_stats(&channel, |s| s.total_delivered += delivered);

        for id in dead {
            self.remove_endpoint(id, "send failed");
        }
    }

    fn enqueue(&mut self, artifact: Artifact) {
        let channel = artifact.channel.clone();
        let mut queue = self.pending.remove(&channel).unwrap_or_default();
        self.expire(&channel, &mut queue);

        queue.push_back(Pending {
            artifact,
            queued_at: Instant::now(),
        });
        let mut overflow = 0u64;
        let cap = self.config.max_pending_per_channel;
        while cap > 0 && queue.len() > cap {
            queue.pop_front();
            overflow += 1;
        }
        if overflow > 0 {
            warn!(target: "broker", channel = %channel, cap, "Pending queue full; dropped oldest artifact");
        }

        let depth = queue.len();
        self.pending.insert(channel.clone(), queue);
        warn!(target: "broker", channel = %channel, depth, "No registered endpoints for channel; queued");
        self.update_stats(&channel, |s| {
            s.total_queued += 1;
            s.dropped_artifacts += overflow;
            s.pending = depth;
        });
    }

    // Drops queued artifacts older than the configured TTL.
    fn expire(&self, channel: &str, queue: &mut VecDeque<Pending>) {
        let Some(ttl) = self.config.pending_ttl else {
            return;
        };
        let before = queue.len();
        queue.retain(|p| !is_expired(p.queued_at, ttl));
        let expired = (before - queue.len()) as u64;
        if expired > 0 {
            debug!(target: "broker", channel = %channel, expired, "Expired pending artifacts");
            self.update_stats(channel, |s| s.dropped_artifacts += expired);
        }
    }

    fn remove_endpoint(&mut self, id: EndpointId, reason: &str) {
        let Some(channel) = self.endpoints.remove(&id) else {
            return;
        };
        let mut remaining = 0;
        if let Some(subscribers) = self.channels.get_mut(&channel) {
            if let Some(reg) = subscribers.remove(&id) {
                reg.pump.abort();
                info!(target: "broker", channel = %channel, identity = %reg.identity, endpoint = %id,
                    reason, "Endpoint removed");
            }
            remaining = subscribers.len();
        }
        if remaining == 0 {
            self.channels.remove(&channel);
        }
        self.update_stats(&channel, |s| s.active_subscribers = remaining);
    }

    fn snapshot(&self) -> BrokerSnapshot {
        let channels = self
            .channels
            .iter()
            .map(|(name, subs)| {
                let mut ids: Vec<String> = subs.values().map(|r| r.identity.clone()).collect();
                ids.sort();
                (name.clone(), ids)
            })
            .collect();
        let pending = self
            .pending
            .iter()
            .map(|(name, q)| (name.clone(), q.len()))
            .collect();
        BrokerSnapshot { channels, pending }
    }

    // Update stats helper function
    fn update_stats<F>(&self, channel: &str, f: F)
    where
        F: FnOnce(&mut ChannelStats),
    {
        let mut entry = self.stats.entry(channel.to_string()).or_default();
        f(entry.value_mut());
    }
}

fn is_expired(queued_at: Instant, ttl: Duration) -> bool {
    queued_at.elapsed() >= ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Role;
    use serde_json::json;

    fn artifact(identity: &str, channel: &str, topic: &str) -> Artifact {
        Artifact::create(
            identity,
            channel,
            topic,
            "application/json",
            Role::Publisher,
            Scope::Query,
            json!({"n": topic}),
        )
    }

    fn register(client: &BrokerClient, identity: &str, channel: &str) -> Endpoint {
        let (own, transfer) = Endpoint::pair();
        let cmd = Artifact::create(
            identity,
            channel,
            "subscribe",
            "application/json",
            Role::Publisher,
            Scope::Register,
            json!(null),
        );
        client.post(cmd, Some(transfer)).unwrap();
        own
    }

    #[tokio::test]
    async fn queue_cap_drops_oldest() {
        let cfg = BrokerConfig {
            max_pending_per_channel: 2,
            ..BrokerConfig::unbounded()
        };
        let broker = Broker::spawn(cfg);
        let client = broker.client();
        for t in ["a", "b", "c"] {
            client.post(artifact("x", "c", t), None).unwrap();
        }
        let snap = broker.snapshot().await.unwrap();
        assert_eq!(snap.pending_depth("c"), 2);
        assert_eq!(broker.stats("c").unwrap().dropped_artifacts, 1);

        let mut own = register(&client, "y", "c");
        assert_eq!(own.recv().await.unwrap().topic, "b");
        assert_eq!(own.recv().await.unwrap().topic, "c");
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ttl_expires_pending_artifacts() {
        let cfg = BrokerConfig {
            pending_ttl: Some(Duration::from_millis(20)),
            ..BrokerConfig::unbounded()
        };
        let broker = Broker::spawn(cfg);
        let client = broker.client();
        client.post(artifact("x", "c", "old"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        client.post(artifact("x", "c", "fresh"), None).unwrap();

        let snap = broker.snapshot().await.unwrap();
        assert_eq!(snap.pending_depth("c"), 1);
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn register_without_endpoint_is_dropped() {
        let broker = Broker::spawn(BrokerConfig::unbounded());
        let cmd = Artifact::command("table", "subscribe", Scope::Register, json!({}));
        broker.client().post(cmd, None).unwrap();
        let snap = broker.snapshot().await.unwrap();
        assert!(snap.channels.is_empty());
        assert!(snap.pending.is_empty());
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_inlet() {
        let broker = Broker::spawn(BrokerConfig::unbounded());
        let client = broker.client();
        let _own = register(&client, "table", "data");
        let snap = broker.shutdown().await.unwrap();
        assert_eq!(snap.subscriber_count("data"), 1);
        assert!(client.snapshot().await.is_err());
    }
}
