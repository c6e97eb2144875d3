//! Activation resolver: `(registry, permissions, authenticated) -> ActivationState`.
//!
//! - No IO
//! - No panics
//! - One linear pass in dependency order

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use modgate_auth::{PermissionName, PermissionSet};
use modgate_core::ModuleId;
use modgate_registry::{ModuleDescriptor, ModuleRegistry};

/// Derived on/off decision for every module of a registry.
///
/// Always recomputed wholesale. Cheap to clone; consumers get read-only
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ActivationState(Arc<BTreeMap<ModuleId, bool>>);

impl ActivationState {
    /// `false` for unknown ids.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.0.get(id).copied().unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<bool> {
        self.0.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModuleId, bool)> {
        self.0.iter().map(|(id, on)| (id, *on))
    }

    pub fn enabled_ids(&self) -> impl Iterator<Item = &ModuleId> {
        self.0.iter().filter(|(_, on)| **on).map(|(id, _)| id)
    }

    /// Modules whose value differs from `previous`, with their new value.
    ///
    /// Ids missing on either side count as `false`. Ids of `registry` come
    /// first in registration order, followed by ids only `previous` knew.
    pub fn diff(&self, previous: &ActivationState, registry: &ModuleRegistry) -> Vec<(ModuleId, bool)> {
        let mut changes: Vec<(ModuleId, bool)> = registry
            .iter()
            .filter_map(|m| {
                let now = self.is_enabled(m.id.as_str());
                (now != previous.is_enabled(m.id.as_str())).then(|| (m.id.clone(), now))
            })
            .collect();

        for (id, was) in previous.iter() {
            if !registry.contains(id.as_str()) && was != self.is_enabled(id.as_str()) {
                changes.push((id.clone(), self.is_enabled(id.as_str())));
            }
        }
        changes
    }
}

/// The permission gate for a single module.
pub fn permission_gate(module: &ModuleDescriptor, permissions: &PermissionSet, authenticated: bool) -> bool {
    if !authenticated {
        return module.required_permissions.is_empty();
    }
    module.required_permissions.is_empty() || permissions.intersects(&module.required_permissions)
}

/// Compute the activation of every module.
///
/// `enabled[m] = declared_enabled[m] && gate(m) && all(enabled[d] for d in deps[m])`.
/// The registry's topological order guarantees every dependency is decided
/// before its dependents.
pub fn resolve(registry: &ModuleRegistry, permissions: &PermissionSet, authenticated: bool) -> ActivationState {
    let mut enabled: BTreeMap<ModuleId, bool> = BTreeMap::new();

    for module in registry.topological_order() {
        let dependencies_on = module
            .dependencies
            .iter()
            .all(|d| enabled.get(d.as_str()).copied().unwrap_or(false));
        let on = module.declared_enabled
            && permission_gate(module, permissions, authenticated)
            && dependencies_on;
        enabled.insert(module.id.clone(), on);
    }

    ActivationState(Arc::new(enabled))
}

/// Why a module is on or off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Enabled,
    /// The static switch (or the remote overlay) turned it off.
    DeclaredDisabled,
    /// None of the required permissions is held.
    MissingPermission {
        required: Vec<PermissionName>,
        authenticated: bool,
    },
    /// A direct dependency resolved to off.
    DependencyDisabled { dependency: ModuleId },
    UnknownModule,
}

impl Decision {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Decision::Enabled)
    }
}

/// Explain the activation of `id`.
///
/// Checks run in the order the resolver applies them, so the first failing
/// rule is reported.
pub fn explain(
    registry: &ModuleRegistry,
    permissions: &PermissionSet,
    authenticated: bool,
    id: &str,
) -> Decision {
    let Some(module) = registry.get(id) else {
        return Decision::UnknownModule;
    };

    if !module.declared_enabled {
        return Decision::DeclaredDisabled;
    }

    if !permission_gate(module, permissions, authenticated) {
        return Decision::MissingPermission {
            required: module.required_permissions.iter().cloned().collect(),
            authenticated,
        };
    }

    let state = resolve(registry, permissions, authenticated);
    match module.dependencies.iter().find(|d| !state.is_enabled(d.as_str())) {
        Some(dependency) => Decision::DependencyDisabled {
            dependency: dependency.clone(),
        },
        None => Decision::Enabled,
    }
}
