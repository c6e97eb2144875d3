use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Deserialize;

use modgate_auth::{Action, PermissionName, PermissionVocabulary};
use modgate_core::{ConfigurationError, ModuleId};

use crate::{ModuleDescriptor, ModuleStatus};

/// Validated, immutable set of module descriptors.
///
/// Cloning is cheap; every clone shares the same descriptors.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    version: String,
    modules: Vec<Arc<ModuleDescriptor>>,
    index: HashMap<ModuleId, usize>,
    /// Indices into `modules`, dependencies before dependents.
    topological: Vec<usize>,
    vocabulary: PermissionVocabulary,
    overlaid: bool,
}

/// On-disk / bundled registry format.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    version: String,
    modules: Vec<ModuleDescriptor>,
    /// Permissions that gate nothing by themselves but are still part of the
    /// vocabulary (e.g. fine-grained actions checked by pages).
    #[serde(default)]
    permissions: Vec<PermissionName>,
}

impl ModuleRegistry {
    /// Validate `modules` and build a registry.
    pub fn new(
        version: impl Into<String>,
        modules: Vec<ModuleDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_extra_permissions(version, modules, Vec::new())
    }

    /// Like [`ModuleRegistry::new`], adding `extra` names to the vocabulary.
    pub fn with_extra_permissions(
        version: impl Into<String>,
        modules: Vec<ModuleDescriptor>,
        extra: Vec<PermissionName>,
    ) -> Result<Self, ConfigurationError> {
        let topological = validate(&modules)?;

        for permission in &extra {
            if !permission.is_well_formed() {
                return Err(ConfigurationError::Parse(format!(
                    "malformed vocabulary permission '{permission}'"
                )));
            }
        }

        let index = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        let vocabulary = derive_vocabulary(&modules, extra);
        let version = version.into();

        tracing::debug!(
            version = %version,
            modules = modules.len(),
            permissions = vocabulary.len(),
            "module registry validated"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                version,
                modules: modules.into_iter().map(Arc::new).collect(),
                index,
                topological,
                vocabulary,
                overlaid: false,
            }),
        })
    }

    /// Parse a JSON registry (`{ "version", "modules": [...], "permissions": [...] }`).
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let file: RegistryFile =
            serde_json::from_str(json).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        Self::with_extra_permissions(file.version, file.modules, file.permissions)
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Whether a remote overlay was applied to produce this registry.
    pub fn is_overlaid(&self) -> bool {
        self.inner.overlaid
    }

    pub fn len(&self) -> usize {
        self.inner.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.modules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.inner
            .index
            .get(id)
            .map(|&i| self.inner.modules[i].as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.index.contains_key(id)
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.inner.modules.iter().map(AsRef::as_ref)
    }

    /// Position of `id` in registration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.inner.index.get(id).copied()
    }

    /// Descriptors ordered so every module comes after all of its dependencies.
    ///
    /// Ties follow registration order.
    pub fn topological_order(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.inner
            .topological
            .iter()
            .map(|&i| self.inner.modules[i].as_ref())
    }

    pub fn vocabulary(&self) -> &PermissionVocabulary {
        &self.inner.vocabulary
    }

    /// Every module `id` relies on, directly or transitively.
    pub fn dependency_closure(&self, id: &str) -> BTreeSet<ModuleId> {
        let mut closure = BTreeSet::new();
        let mut pending: Vec<&ModuleId> = match self.get(id) {
            Some(module) => module.dependencies.iter().collect(),
            None => return closure,
        };

        while let Some(next) = pending.pop() {
            if closure.insert(next.clone()) {
                if let Some(module) = self.get(next.as_str()) {
                    pending.extend(module.dependencies.iter());
                }
            }
        }
        closure
    }

    /// Every module that relies on `id`, directly or transitively, in
    /// registration order.
    pub fn dependents(&self, id: &str) -> Vec<ModuleId> {
        self.iter()
            .filter(|m| m.id.as_str() != id && self.dependency_closure(m.id.as_str()).contains(id))
            .map(|m| m.id.clone())
            .collect()
    }

    /// Build a new registry whose `declared_enabled` flags come from `statuses`.
    ///
    /// Modules absent from `statuses` keep their static value. Statuses naming
    /// unknown modules are ignored.
    pub fn with_overlay(&self, statuses: &[ModuleStatus]) -> Self {
        let mut flags: HashMap<&str, bool> = HashMap::with_capacity(statuses.len());
        for status in statuses {
            if self.contains(status.id.as_str()) {
                flags.insert(status.id.as_str(), status.enabled);
            } else {
                tracing::warn!(module = %status.id, "overlay names unknown module; ignored");
            }
        }

        let modules = self
            .inner
            .modules
            .iter()
            .map(|m| match flags.get(m.id.as_str()) {
                Some(&enabled) if enabled != m.declared_enabled => {
                    Arc::new(m.with_declared_enabled(enabled))
                }
                _ => Arc::clone(m),
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                version: self.inner.version.clone(),
                modules,
                index: self.inner.index.clone(),
                topological: self.inner.topological.clone(),
                vocabulary: self.inner.vocabulary.clone(),
                overlaid: true,
            }),
        }
    }
}

fn derive_vocabulary(modules: &[ModuleDescriptor], extra: Vec<PermissionName>) -> PermissionVocabulary {
    let mut vocabulary = PermissionVocabulary::new(extra);
    for module in modules {
        for permission in &module.required_permissions {
            vocabulary.insert(permission.clone());
        }
        for action in Action::ALL {
            vocabulary.insert(PermissionName::for_action(&module.id, action));
        }
    }
    vocabulary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Check a module table and return its topological order (indices,
/// dependencies first).
///
/// Rejects malformed ids and permissions, duplicate ids, dependencies on
/// unknown modules, and dependency cycles (three-colour DFS).
pub fn validate(modules: &[ModuleDescriptor]) -> Result<Vec<usize>, ConfigurationError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(modules.len());
    for (i, module) in modules.iter().enumerate() {
        if !module.id.is_well_formed() {
            return Err(ConfigurationError::InvalidModuleId(module.id.to_string()));
        }
        if index.insert(module.id.as_str(), i).is_some() {
            return Err(ConfigurationError::DuplicateModule(module.id.clone()));
        }
        if let Some(bad) = module.required_permissions.iter().find(|p| !p.is_well_formed()) {
            return Err(ConfigurationError::InvalidPermission {
                module: module.id.clone(),
                permission: bad.to_string(),
            });
        }
    }

    let mut colour = vec![Colour::White; modules.len()];
    let mut order = Vec::with_capacity(modules.len());
    for i in 0..modules.len() {
        if colour[i] == Colour::White {
            visit(i, modules, &index, &mut colour, &mut order)?;
        }
    }
    Ok(order)
}

/// Depth-first walk from `root` with an explicit stack, so chain depth is
/// bounded by the heap and not the thread stack.
fn visit(
    root: usize,
    modules: &[ModuleDescriptor],
    index: &HashMap<&str, usize>,
    colour: &mut [Colour],
    order: &mut Vec<usize>,
) -> Result<(), ConfigurationError> {
    // One frame per grey module: its index and its remaining dependencies.
    let mut stack = vec![(root, modules[root].dependencies.iter())];
    colour[root] = Colour::Grey;

    while let Some((i, dependencies)) = stack.last_mut() {
        let i = *i;
        let Some(dependency) = dependencies.next() else {
            stack.pop();
            colour[i] = Colour::Black;
            order.push(i);
            continue;
        };

        let Some(&j) = index.get(dependency.as_str()) else {
            return Err(ConfigurationError::UnknownDependency {
                module: modules[i].id.clone(),
                dependency: dependency.clone(),
            });
        };

        match colour[j] {
            Colour::White => {
                colour[j] = Colour::Grey;
                stack.push((j, modules[j].dependencies.iter()));
            }
            Colour::Grey => {
                let start = stack.iter().position(|(k, _)| *k == j).unwrap_or(0);
                let mut path: Vec<ModuleId> =
                    stack[start..].iter().map(|(k, _)| modules[*k].id.clone()).collect();
                path.push(modules[j].id.clone());
                return Err(ConfigurationError::CyclicDependency { path });
            }
            Colour::Black => {}
        }
    }
    Ok(())
}
