use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::PermissionName;

/// The current user's flat set of held permissions.
///
/// Cheap to clone: consumers always receive a snapshot and can never mutate
/// the store's copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(Arc<BTreeSet<PermissionName>>);

/// Difference between two permission sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionDelta {
    pub added: Vec<PermissionName>,
    pub removed: Vec<PermissionName>,
}

impl PermissionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: &PermissionName) -> bool {
        self.0.contains(permission)
    }

    /// `true` when at least one of `required` is held.
    pub fn intersects<'a>(&self, required: impl IntoIterator<Item = &'a PermissionName>) -> bool {
        required.into_iter().any(|p| self.0.contains(p))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionName> {
        self.0.iter()
    }

    /// What changed going from `previous` to `self`.
    pub fn delta_from(&self, previous: &PermissionSet) -> PermissionDelta {
        PermissionDelta {
            added: self.0.difference(&previous.0).cloned().collect(),
            removed: previous.0.difference(&self.0).cloned().collect(),
        }
    }
}

impl FromIterator<PermissionName> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = PermissionName>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}
