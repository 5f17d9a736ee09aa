//! Domain events and their stored envelope.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Events are carried around as [`FullEvent`]s: the JSON payload
//! plus an [`EventDescriptor`] that says which stream, version and sub-stream
//! the event belongs to.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// String headers attached to events and commits.
pub type Headers = BTreeMap<String, String>;

/// Well-known header keys.
pub mod headers {
    /// Out-of-band channel an event was raised on.
    pub const OOB: &str = "oob";
    /// Whether an out-of-band event is transient.
    pub const OOB_TRANSIENT: &str = "oob.transient";
    /// Retention of an out-of-band event, in days.
    pub const OOB_DAYS_TO_LIVE: &str = "oob.days_to_live";
    /// Strategy that re-applied an event while resolving a conflict.
    pub const CONFLICT_RESOLUTION: &str = "conflict_resolution";
    /// Commit an event was written in.
    pub const COMMIT_ID: &str = "commit_id";
}

/// Marker trait for events that can be applied to an entity and persisted.
///
/// Each event carries a unique [`Self::KIND`] identifier so routes can find the
/// handler for a stored payload when an entity is rebuilt.
pub trait DomainEvent {
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`]; you never implement it
/// yourself.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Identifier of a stream (and of the entity that owns it).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Id {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for Id {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Reference from a child entity to one of its parents.
///
/// Children know their parent chain but never own the parents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// Kind of the parent entity.
    pub entity: String,
    /// Identifier of the parent entity.
    pub id: Id,
}

impl ParentRef {
    #[must_use]
    pub fn new(entity: impl Into<String>, id: impl Into<Id>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

/// Sub-stream an event belongs to.
///
/// Only [`StreamType::Domain`] events take part in conflict resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    Domain,
    Oob,
    Delayed,
    Snapshot,
    Poco,
}

impl StreamType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "DOMAIN",
            Self::Oob => "OOB",
            Self::Delayed => "DELAYED",
            Self::Snapshot => "SNAPSHOT",
            Self::Poco => "POCO",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event lives and how it was written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Kind of the entity owning the stream.
    pub entity: String,
    pub stream_type: StreamType,
    pub bucket: String,
    pub stream_id: Id,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
    /// Version of the event within its stream. The store stamps the final
    /// value when the event is persisted.
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub commit_headers: Headers,
}

/// A domain event payload with its descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullEvent {
    pub event_id: Option<Uuid>,
    /// [`DomainEvent::KIND`] of the payload.
    pub kind: String,
    /// The serialized domain event.
    pub event: serde_json::Value,
    pub descriptor: EventDescriptor,
}

impl FullEvent {
    /// Decode the payload into a concrete event type.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the payload does not match `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.event)
    }

    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        self.descriptor.stream_type
    }

    /// Out-of-band channel this event was raised on, if any.
    #[must_use]
    pub fn oob_id(&self) -> Option<&str> {
        self.descriptor.headers.get(headers::OOB).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: u32,
    }

    impl DomainEvent for Deposited {
        const KIND: &'static str = "account.deposited";
    }

    fn full_event(stream_type: StreamType) -> FullEvent {
        FullEvent {
            event_id: Some(Uuid::new_v4()),
            kind: Deposited::KIND.to_string(),
            event: serde_json::json!({ "amount": 10 }),
            descriptor: EventDescriptor {
                entity: "account".to_string(),
                stream_type,
                bucket: "default".to_string(),
                stream_id: Id::from("a-1"),
                parents: Vec::new(),
                version: 0,
                timestamp: Utc::now(),
                headers: Headers::new(),
                commit_headers: Headers::new(),
            },
        }
    }

    #[test]
    fn event_kind_matches_constant() {
        assert_eq!(Deposited { amount: 1 }.kind(), "account.deposited");
    }

    #[test]
    fn full_event_decodes_payload() {
        let event = full_event(StreamType::Domain);
        let decoded: Deposited = event.decode().unwrap();
        assert_eq!(decoded, Deposited { amount: 10 });
    }

    #[test]
    fn full_event_rejects_wrong_shape() {
        let mut event = full_event(StreamType::Domain);
        event.event = serde_json::json!({ "wrong": true });
        assert!(event.decode::<Deposited>().is_err());
    }

    #[test]
    fn stream_type_serializes_upper_case() {
        let json = serde_json::to_string(&StreamType::Oob).unwrap();
        assert_eq!(json, "\"OOB\"");
        assert_eq!(StreamType::Snapshot.to_string(), "SNAPSHOT");
    }

    #[test]
    fn oob_id_reads_header() {
        let mut event = full_event(StreamType::Oob);
        assert_eq!(event.oob_id(), None);
        event
            .descriptor
            .headers
            .insert(headers::OOB.to_string(), "audit".to_string());
        assert_eq!(event.oob_id(), Some("audit"));
    }

    #[test]
    fn id_converts_from_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(Id::from(uuid).as_str(), uuid.to_string());
    }
}
