//! Messaging facade: how components talk to the broker.
//!
//! A component never sees the broker's tables. It asks for a subscription on
//! a channel, gets back the endpoint it keeps, and publishes through it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ArtifactFactory, Scope, JSON_MEDIA_TYPE};
use crate::broker::BrokerClient;
use crate::endpoint::{Endpoint, EndpointId, EndpointReceiver, EndpointSender};
use crate::{Result, TabulaError};

/// Topic carried by registration commands.
pub const SUBSCRIBE_TOPIC: &str = "subscribe";

/// Callback for artifacts delivered to a subscription
#[async_trait]
pub trait ArtifactHandler: Send + Sync {
    async fn handle(&self, artifact: Artifact) -> Result<()>;
}

/// Per-component entry point to the broker.
#[derive(Debug, Clone)]
pub struct Messaging {
    client: BrokerClient,
}

impl Messaging {
    pub fn new(client: BrokerClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    /// Registers `port` with the broker on `channel` under `identity`.
    ///
    /// Ownership of `port` moves to the broker; whatever the caller's side of
    /// the pair sends afterwards is routed on `channel`.
    pub fn subscribe_endpoint(
        &self,
        identity: &str,
        channel: &str,
        port: Endpoint,
    ) -> Result<()> {
        let factory = ArtifactFactory::new(identity, channel, "text/plain");
        let cmd = factory.command(
            SUBSCRIBE_TOPIC,
            Scope::Register,
            json!({ "port": port.id().as_u64() }),
        );
        self.client.post(cmd, Some(port))?;
        debug!(target: "messaging", identity = %identity, channel = %channel, "Subscribed to channel");
        Ok(())
    }

    /// Creates an endpoint pair, keeps one side and registers the other.
    pub fn subscribe(&self, identity: &str, channel: &str) -> Result<Subscription> {
        let (own, transfer) = Endpoint::pair();
        self.subscribe_endpoint(identity, channel, transfer)?;
        let (sender, receiver) = own.into_split();
        Ok(Subscription {
            link: Link::new(identity, channel, sender),
            receiver,
        })
    }

    /// Callback form of [`Messaging::subscribe`].
    ///
    /// Delivered artifacts are passed to `handler` one at a time, in delivery
    /// order, on a spawned task. Handler errors are logged and do not stop
    /// the subscription.
    pub fn subscribe_with(
        &self,
        identity: &str,
        channel: &str,
        handler: Arc<dyn ArtifactHandler>,
    ) -> Result<SubscriptionHandle> {
        let Subscription { link, mut receiver } = self.subscribe(identity, channel)?;
        let who = link.identity.clone();
        let task = tokio::spawn(async move {
            while let Some(artifact) = receiver.recv().await {
                let id = artifact.id.clone();
                if let Err(e) = handler.handle(artifact).await {
                    warn!(target: "messaging", identity = %who, artifact = %id, error = %e,
                        "Artifact handler failed");
                }
            }
            debug!(target: "messaging", identity = %who, "Subscription closed by broker");
        });
        Ok(SubscriptionHandle { link, task })
    }

    /// Posts an artifact straight to the broker without a subscription.
    ///
    /// Every subscriber on the artifact's channel receives it, or it waits in
    /// the channel's pending queue if there are none yet.
    pub fn post(&self, artifact: Artifact) -> Result<()> {
        if artifact.scope == Scope::Register {
            return Err(TabulaError::ReservedScope);
        }
        self.client.post(artifact, None)
    }
}

// Sending side shared by both subscription flavours.
#[derive(Debug)]
struct Link {
    identity: String,
    channel: String,
    sender: EndpointSender,
}

impl Link {
    fn new(identity: &str, channel: &str, sender: EndpointSender) -> Self {
        Self {
            identity: identity.to_string(),
            channel: channel.to_string(),
            sender,
        }
    }

    fn publish(&self, artifact: Artifact) -> Result<()> {
        if artifact.scope == Scope::Register {
            warn!(target: "messaging", identity = %self.identity,
                "Refusing to publish a register artifact");
            return Err(TabulaError::ReservedScope);
        }
        self.sender.send(artifact)
    }

    fn publish_validated(&self, artifact: Artifact) -> Result<()> {
        match artifact.validate() {
            Ok(artifact) => self.publish(artifact),
            Err(e) => {
                warn!(target: "messaging", identity = %self.identity, channel = %self.channel,
                    error = %e, "Artifact failed validation; not sent");
                Err(e.into())
            }
        }
    }

    fn factory(&self) -> ArtifactFactory {
        ArtifactFactory::new(self.identity.clone(), self.channel.clone(), JSON_MEDIA_TYPE)
    }
}

/// A registered endpoint, kept by the component that subscribed.
///
/// Dropping it tells the broker to forget the registration.
#[derive(Debug)]
pub struct Subscription {
    link: Link,
    receiver: EndpointReceiver,
}

impl Subscription {
    pub fn identity(&self) -> &str {
        &self.link.identity
    }

    pub fn channel(&self) -> &str {
        &self.link.channel
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.receiver.id()
    }

    /// Factory bound to this subscription's identity and channel.
    pub fn factory(&self) -> ArtifactFactory {
        self.link.factory()
    }

    /// Sends an already-built artifact. No validation happens here.
    pub fn publish(&self, artifact: Artifact) -> Result<()> {
        self.link.publish(artifact)
    }

    /// Validates, then sends. Invalid artifacts are logged and never sent.
    pub fn publish_validated(&self, artifact: Artifact) -> Result<()> {
        self.link.publish_validated(artifact)
    }

    pub async fn recv(&mut self) -> Option<Artifact> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {
        debug!(target: "messaging", identity = %self.link.identity, channel = %self.link.channel,
            "Unsubscribed");
    }
}

/// Handle for a callback subscription created by [`Messaging::subscribe_with`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    link: Link,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn identity(&self) -> &str {
        &self.link.identity
    }

    pub fn channel(&self) -> &str {
        &self.link.channel
    }

    pub fn factory(&self) -> ArtifactFactory {
        self.link.factory()
    }

    pub fn publish(&self, artifact: Artifact) -> Result<()> {
        self.link.publish(artifact)
    }

    pub fn publish_validated(&self, artifact: Artifact) -> Result<()> {
        self.link.publish_validated(artifact)
    }

    /// Stops the handler task and releases the endpoint.
    pub fn unsubscribe(self) {
        self.task.abort();
        debug!(target: "messaging", identity = %self.link.identity, channel = %self.link.channel,
            "Unsubscribed");
    }
}
