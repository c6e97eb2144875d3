//! Typed payloads of the events the engine emits.

use serde::{Deserialize, Serialize};

use modgate_auth::PermissionName;
use modgate_core::{ModuleId, UserId};
use modgate_events::{EventKind, EventPayload};

pub const RECONCILER_SOURCE: &str = "reconciler";
pub const PERMISSION_STORE_SOURCE: &str = "permission-store";
pub const QUERY_CACHE_SOURCE: &str = "query-cache";

/// One module switched on or off during reconciliation pass `generation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleChanged {
    pub module_id: ModuleId,
    pub enabled: bool,
    pub generation: u64,
}

impl EventPayload for ModuleChanged {
    const KIND: EventKind = EventKind::ModuleChange;
}

/// Summary of a reconciliation pass that changed at least one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    pub generation: u64,
    pub changed: Vec<ModuleId>,
    pub enabled: Vec<ModuleId>,
    pub authenticated: bool,
}

impl EventPayload for StateChanged {
    const KIND: EventKind = EventKind::StateChange;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsChanged {
    pub user_id: Option<UserId>,
    pub added: Vec<PermissionName>,
    pub removed: Vec<PermissionName>,
    /// Size of the held set after the change.
    pub total: usize,
}

impl EventPayload for PermissionsChanged {
    const KIND: EventKind = EventKind::PermissionChange;
}

/// Emitted by the data-fetch layer after it refreshed or mutated `entity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSynced {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}

impl DataSynced {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ids: Vec::new(),
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

impl EventPayload for DataSynced {
    const KIND: EventKind = EventKind::DataSync;
}
