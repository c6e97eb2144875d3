use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use modgate_auth::PermissionName;
use modgate_core::ModuleId;

/// A navigation entry contributed by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub label: String,
    pub icon: String,
    pub path: String,
    /// Ascending sort key across all enabled modules.
    pub order: i32,
}

impl MenuEntry {
    pub fn new(
        label: impl Into<String>,
        icon: impl Into<String>,
        path: impl Into<String>,
        order: i32,
    ) -> Self {
        Self {
            label: label.into(),
            icon: icon.into(),
            path: path.into(),
            order,
        }
    }
}

/// Immutable description of one feature module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Static on/off switch, independent of permissions.
    #[serde(default = "default_enabled", alias = "enabled")]
    pub declared_enabled: bool,
    #[serde(default)]
    pub dependencies: BTreeSet<ModuleId>,
    /// Module is usable if the user holds at least one of these.
    /// Empty means public.
    #[serde(default)]
    pub required_permissions: BTreeSet<PermissionName>,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub menu_entries: Vec<MenuEntry>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<ModuleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            declared_enabled: true,
            dependencies: BTreeSet::new(),
            required_permissions: BTreeSet::new(),
            routes: Vec::new(),
            menu_entries: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.declared_enabled = false;
        self
    }

    pub fn depends_on<I, M>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ModuleId>,
    {
        self.dependencies.extend(modules.into_iter().map(Into::into));
        self
    }

    pub fn requires(mut self, permissions: impl IntoIterator<Item = PermissionName>) -> Self {
        self.required_permissions.extend(permissions);
        self
    }

    pub fn route(mut self, path: impl Into<String>) -> Self {
        self.routes.push(path.into());
        self
    }

    pub fn menu(mut self, entry: MenuEntry) -> Self {
        self.menu_entries.push(entry);
        self
    }

    /// `true` when no permission is needed, i.e. even anonymous sessions pass
    /// the permission gate.
    pub fn is_public(&self) -> bool {
        self.required_permissions.is_empty()
    }

    /// Copy of this descriptor with a different static switch.
    pub fn with_declared_enabled(&self, enabled: bool) -> Self {
        Self {
            declared_enabled: enabled,
            ..self.clone()
        }
    }
}
