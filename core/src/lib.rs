// Tabula Core Library
// In-process artifact broker connecting the CSV explorer's components

pub mod artifact;
pub mod broker;
pub mod config;
pub mod endpoint;
pub mod messaging;
pub mod telemetry;

// Export core types
pub use artifact::{validate_json, Artifact, ArtifactFactory, Role, Scope, ValidationError};
pub use broker::{Broker, BrokerClient, BrokerSnapshot, ChannelStats};
pub use config::BrokerConfig;
pub use endpoint::{Endpoint, EndpointId};
pub use messaging::{ArtifactHandler, Messaging, Subscription, SubscriptionHandle};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabulaError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Endpoint closed: {0}")]
    EndpointClosed(String),

    #[error("The register scope is reserved for broker registration")]
    ReservedScope,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, TabulaError>;

/// Core runtime
pub struct Tabula {
    pub config: BrokerConfig,
    pub broker: Broker,
    pub messaging: Messaging,
}

impl Tabula {
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        tracing::info!("Starting Tabula...");
        let broker = Broker::spawn(config.clone());
        let messaging = Messaging::new(broker.client());
        tracing::info!("Tabula started successfully");
        Ok(Self {
            config,
            broker,
            messaging,
        })
    }

    pub async fn shutdown(self) -> Result<BrokerSnapshot> {
        tracing::info!("Shutting down Tabula...");
        let snapshot = self.broker.shutdown().await?;
        tracing::info!("Tabula shut down successfully");
        Ok(snapshot)
    }
}
