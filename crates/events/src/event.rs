use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The four event families carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Summary notification: "something about activation changed".
    StateChange,
    /// A data-fetch layer refreshed or mutated some entity.
    DataSync,
    /// One module switched on or off.
    ModuleChange,
    /// The held permission set changed.
    PermissionChange,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::StateChange,
        EventKind::DataSync,
        EventKind::ModuleChange,
        EventKind::PermissionChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "state_change",
            EventKind::DataSync => "data_sync",
            EventKind::ModuleChange => "module_change",
            EventKind::PermissionChange => "permission_change",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed payload that always travels under one [`EventKind`].
pub trait EventPayload: Serialize + DeserializeOwned {
    const KIND: EventKind;
}

/// An immutable notification.
///
/// Events are facts: once emitted they are never edited, only evicted from
/// the bus history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    #[serde(rename = "type")]
    kind: EventKind,
    payload: Value,
    timestamp: DateTime<Utc>,
    source: Cow<'static, str>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<Cow<'static, str>>, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Build an event from a typed payload.
    ///
    /// A payload that fails to serialize is recorded as `null`.
    pub fn from_payload<P: EventPayload>(source: impl Into<Cow<'static, str>>, payload: &P) -> Self {
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(P::KIND, source, value)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Decode the payload as `P`, if the kind matches and the shape fits.
    pub fn decode<P: EventPayload>(&self) -> Option<P> {
        if self.kind != P::KIND {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}
