//! Linked endpoint pairs.
//!
//! An endpoint pair is two handles joined back to back: whatever is sent on
//! one comes out of the other. A component keeps one side and moves the other
//! into the broker; once moved, the previous holder has no way to touch it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::artifact::Artifact;
use crate::{Result, TabulaError};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one side of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// One side of a linked pair.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    peer: EndpointId,
    tx: mpsc::UnboundedSender<Artifact>,
    rx: mpsc::UnboundedReceiver<Artifact>,
}

impl Endpoint {
    /// Creates two linked endpoints.
    ///
    /// ```
    /// use tabula_core::endpoint::Endpoint;
    ///
    /// let (a, b) = Endpoint::pair();
    /// assert_eq!(a.peer(), b.id());
    /// assert_eq!(b.peer(), a.id());
    /// ```
    pub fn pair() -> (Endpoint, Endpoint) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_id = EndpointId::next();
        let b_id = EndpointId::next();
        (
            Endpoint {
                id: a_id,
                peer: b_id,
                tx: a_tx,
                rx: a_rx,
            },
            Endpoint {
                id: b_id,
                peer: a_id,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peer(&self) -> EndpointId {
        self.peer
    }

    /// Sends to the other side. Never blocks.
    pub fn send(&self, artifact: Artifact) -> Result<()> {
        self.tx
            .send(artifact)
            .map_err(|_| TabulaError::EndpointClosed(self.id.to_string()))
    }

    /// Waits for the next artifact from the other side.
    ///
    /// Returns `None` once the other side has been dropped and everything it
    /// sent has been drained.
    pub async fn recv(&mut self) -> Option<Artifact> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Artifact> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn into_split(self) -> (EndpointSender, EndpointReceiver) {
        (
            EndpointSender {
                id: self.id,
                tx: self.tx,
            },
            EndpointReceiver {
                id: self.id,
                rx: self.rx,
            },
        )
    }
}

/// Sending half of a split endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSender {
    id: EndpointId,
    tx: mpsc::UnboundedSender<Artifact>,
}

impl EndpointSender {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn send(&self, artifact: Artifact) -> Result<()> {
        self.tx
            .send(artifact)
            .map_err(|_| TabulaError::EndpointClosed(self.id.to_string()))
    }

    /// Like [`EndpointSender::send`], but hands the artifact back when the
    /// peer is gone.
    pub(crate) fn deliver(&self, artifact: Artifact) -> std::result::Result<(), Artifact> {
        self.tx.send(artifact).map_err(|e| e.0)
    }

    /// True once the receiving side on the peer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a split endpoint.
#[derive(Debug)]
pub struct EndpointReceiver {
    id: EndpointId,
    rx: mpsc::UnboundedReceiver<Artifact>,
}

impl EndpointReceiver {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Artifact> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Role, Scope};
    use serde_json::json;

    fn artifact(topic: &str) -> Artifact {
        Artifact::create(
            "tester",
            "data",
            topic,
            "application/json",
            Role::Publisher,
            Scope::Load,
            json!({}),
        )
    }

    #[tokio::test]
    async fn message_crosses_to_peer() {
        let (mut a, mut b) = Endpoint::pair();
        a.send(artifact("one")).unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.topic, "one");
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_peer_closes_sender() {
        let (a, b) = Endpoint::pair();
        let (tx, _rx) = a.into_split();
        assert!(!tx.is_closed());
        drop(b);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.send(artifact("lost")),
            Err(TabulaError::EndpointClosed(_))
        ));
    }

    #[tokio::test]
    async fn receiver_ends_when_peer_dropped() {
        let (a, b) = Endpoint::pair();
        let (_tx, mut rx) = b.into_split();
        a.send(artifact("last")).unwrap();
        drop(a);
        assert_eq!(rx.recv().await.map(|x| x.topic), Some("last".to_string()));
        assert!(rx.recv().await.is_none());
    }
}
