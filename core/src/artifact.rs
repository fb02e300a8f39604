use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Reserved channel used by `Artifact::command` for broker-wide control traffic.
pub const CONTROL_CHANNEL: &str = "broadcast";

/// Media type stamped on control artifacts.
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// Field names in validation order, spelled as they appear on the wire.
pub mod fields {
    pub const ID: &str = "id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const IDENTITY: &str = "identity";
    pub const CHANNEL: &str = "channel";
    pub const TOPIC: &str = "topic";
    pub const MEDIA_TYPE: &str = "mediaType";
    pub const ROLE: &str = "role";
    pub const SCOPE: &str = "scope";
    pub const PAYLOAD: &str = "payload";

    pub const REQUIRED: [&str; 9] = [
        ID, TIMESTAMP, IDENTITY, CHANNEL, TOPIC, MEDIA_TYPE, ROLE, SCOPE, PAYLOAD,
    ];
}

/// Stance of the sender. Informational only; the broker never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Scope of an artifact.
///
/// `Register` is reserved for the registration protocol between a
/// subscription and the broker; every other scope is application traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Load,
    Transform,
    Query,
    Register,
}

impl Scope {
    /// Control scopes may carry an empty payload.
    pub fn is_control(self) -> bool {
        matches!(self, Scope::Register)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Load => "load",
            Scope::Transform => "transform",
            Scope::Query => "query",
            Scope::Register => "register",
        };
        f.write_str(s)
    }
}

/// Raised when an artifact fails envelope validation.
///
/// Every variant names the offending field.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{field} is missing or invalid")]
    Missing { field: &'static str },

    #[error("id must be a non-empty string")]
    InvalidId,

    #[error("timestamp must be a positive number, got {0}")]
    InvalidTimestamp(i64),

    #[error("artifact could not be decoded: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ValidationError {
    /// The wire name of the field that failed, when there is one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::Missing { field } => Some(*field),
            ValidationError::InvalidId => Some(fields::ID),
            ValidationError::InvalidTimestamp(_) => Some(fields::TIMESTAMP),
            ValidationError::Malformed(_) => None,
        }
    }
}

/// Message envelope exchanged between every component and the broker.
///
/// An artifact wraps an arbitrary JSON payload with the metadata any receiver
/// needs to make sense of it: who sent it (`identity`), where it is routed
/// (`channel`), what it is about (`topic`) and how the payload is encoded
/// (`media_type`).
///
/// `id` and `timestamp` are generated by [`Artifact::create`] and are never
/// taken from the caller.
///
/// # Examples
///
/// ```
/// use tabula_core::artifact::{Artifact, Role, Scope};
/// use serde_json::json;
///
/// let artifact = Artifact::create(
///     "upload",
///     "data",
///     "uploadComplete",
///     "application/json",
///     Role::Publisher,
///     Scope::Load,
///     json!({"headers": ["a", "b"]}),
/// )
/// .validate()
/// .unwrap();
/// assert_eq!(artifact.topic, "uploadComplete");
/// assert!(artifact.timestamp > 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub timestamp: i64,
    pub identity: String,
    pub channel: String,
    pub topic: String,
    pub media_type: String,
    pub role: Role,
    pub scope: Scope,
    pub payload: Value,
}

// Highest timestamp handed out so far; keeps timestamps non-decreasing even if
// the wall clock steps backwards.
static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

fn next_timestamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis().max(1);
    let prev = LAST_TIMESTAMP_MS.fetch_max(now, Ordering::AcqRel);
    now.max(prev)
}

impl Artifact {
    /// Builds a new artifact with a fresh id and timestamp.
    ///
    /// A `null` payload on a control scope is replaced by an empty object.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        identity: impl Into<String>,
        channel: impl Into<String>,
        topic: impl Into<String>,
        media_type: impl Into<String>,
        role: Role,
        scope: Scope,
        payload: Value,
    ) -> Self {
        let payload = if payload.is_null() && scope.is_control() {
            json!({})
        } else {
            payload
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: next_timestamp(),
            identity: identity.into(),
            channel: channel.into(),
            topic: topic.into(),
            media_type: media_type.into(),
            role,
            scope,
            payload,
        }
    }

    /// Builds a publisher command on [`CONTROL_CHANNEL`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tabula_core::artifact::{Artifact, Role, Scope, CONTROL_CHANNEL};
    /// use serde_json::Value;
    ///
    /// let cmd = Artifact::command("table", "subscribe", Scope::Register, Value::Null);
    /// assert_eq!(cmd.channel, CONTROL_CHANNEL);
    /// assert_eq!(cmd.role, Role::Publisher);
    /// assert!(cmd.payload.is_object());
    /// ```
    pub fn command(
        identity: impl Into<String>,
        topic: impl Into<String>,
        scope: Scope,
        payload: Value,
    ) -> Self {
        Self::create(
            identity,
            CONTROL_CHANNEL,
            topic,
            JSON_MEDIA_TYPE,
            Role::Publisher,
            scope,
            payload,
        )
    }

    pub fn is_control(&self) -> bool {
        self.scope.is_control()
    }

    /// Checks every envelope invariant and hands the artifact back unchanged.
    ///
    /// Fails on the first missing or invalid field, in wire order.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::InvalidId);
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::InvalidTimestamp(self.timestamp));
        }
        let text_fields = [
            (fields::IDENTITY, &self.identity),
            (fields::CHANNEL, &self.channel),
            (fields::TOPIC, &self.topic),
            (fields::MEDIA_TYPE, &self.media_type),
        ];
        for (field, value) in text_fields {
            if value.trim().is_empty() {
                return Err(ValidationError::Missing { field });
            }
        }
        if self.payload.is_null() && !self.scope.is_control() {
            return Err(ValidationError::Missing {
                field: fields::PAYLOAD,
            });
        }
        Ok(self)
    }
}

/// Validates an untyped JSON document and decodes it into an [`Artifact`].
///
/// Keys are checked in wire order, by presence and by type, before decoding,
/// so a missing or mistyped field is reported by name rather than as a
/// decode failure.
pub fn validate_json(value: &Value) -> Result<Artifact, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::Missing {
        field: fields::ID,
    })?;
    for field in fields::REQUIRED {
        let entry = obj.get(field).filter(|v| !v.is_null());
        match (field, entry) {
            (fields::ID, Some(Value::String(s))) if !s.trim().is_empty() => {}
            (fields::ID, _) => return Err(ValidationError::InvalidId),
            (fields::TIMESTAMP, Some(v)) => match v.as_i64() {
                Some(ts) if ts > 0 => {}
                Some(ts) => return Err(ValidationError::InvalidTimestamp(ts)),
                None => return Err(ValidationError::Missing { field }),
            },
            (fields::ROLE, Some(v)) if Role::deserialize(v).is_ok() => {}
            (fields::SCOPE, Some(v)) if Scope::deserialize(v).is_ok() => {}
            (fields::ROLE | fields::SCOPE, _) => return Err(ValidationError::Missing { field }),
            (fields::PAYLOAD, Some(_)) => {}
            // control artifacts are allowed to arrive without a payload
            (fields::PAYLOAD, None) if obj.get(fields::SCOPE) == Some(&json!("register")) => {}
            (_, Some(Value::String(s))) if !s.trim().is_empty() => {}
            _ => return Err(ValidationError::Missing { field }),
        }
    }
    let mut artifact: Artifact = match obj.get(fields::PAYLOAD) {
        Some(_) => serde_json::from_value(value.clone())?,
        None => {
            let mut with_payload = obj.clone();
            with_payload.insert(fields::PAYLOAD.to_string(), json!({}));
            serde_json::from_value(Value::Object(with_payload))?
        }
    };
    if artifact.payload.is_null() && artifact.is_control() {
        artifact.payload = json!({});
    }
    artifact.validate()
}

/// Artifact factory bound to a component's identity, channel and media type.
///
/// Components build every artifact they publish through one of these so the
/// routing metadata stays consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFactory {
    identity: String,
    channel: String,
    media_type: String,
}

impl ArtifactFactory {
    pub fn new(
        identity: impl Into<String>,
        channel: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            channel: channel.into(),
            media_type: media_type.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn create(
        &self,
        topic: impl Into<String>,
        role: Role,
        scope: Scope,
        payload: Value,
    ) -> Artifact {
        Artifact::create(
            self.identity.clone(),
            self.channel.clone(),
            topic,
            self.media_type.clone(),
            role,
            scope,
            payload,
        )
    }

    /// Publisher artifact with the factory's defaults; the common case.
    pub fn publish(&self, topic: impl Into<String>, scope: Scope, payload: Value) -> Artifact {
        self.create(topic, Role::Publisher, scope, payload)
    }

    /// Command on the factory's own channel (JSON media type, publisher role).
    pub fn command(&self, topic: impl Into<String>, scope: Scope, payload: Value) -> Artifact {
        Artifact::create(
            self.identity.clone(),
            self.channel.clone(),
            topic,
            JSON_MEDIA_TYPE,
            Role::Publisher,
            scope,
            payload,
        )
    }
}
