use std::borrow::Cow;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modgate_core::ModuleId;

/// Permission identifier.
///
/// Permissions are dotted lowercase names (e.g. `"inventory.read"`,
/// `"admin.users.update"`). A name is only constructed through [`PermissionName::parse`]
/// or [`PermissionName::for_action`], so a typo fails loudly instead of silently
/// never matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PermissionName(Cow<'static, str>);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("malformed permission name '{0}'")]
    Malformed(String),

    #[error("permission '{0}' is not part of the vocabulary")]
    Unknown(String),
}

impl PermissionName {
    /// Parse a dotted permission name.
    pub fn parse(name: &str) -> Result<Self, PermissionError> {
        if is_well_formed(name) {
            Ok(Self(Cow::Owned(name.to_string())))
        } else {
            Err(PermissionError::Malformed(name.to_string()))
        }
    }

    /// Wrap a literal without validation. Registry validation rejects
    /// malformed literals at load time.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn is_well_formed(&self) -> bool {
        is_well_formed(&self.0)
    }

    /// The conventional `<module>.<action>` permission.
    pub fn for_action(module: &ModuleId, action: Action) -> Self {
        Self(Cow::Owned(format!("{}.{}", module.as_str(), action.as_str())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first dotted segment, usually the owning module.
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// The trailing segment parsed as a standard action, if it is one.
    pub fn action(&self) -> Option<Action> {
        self.0.rsplit('.').next().and_then(|s| s.parse().ok())
    }
}

fn is_well_formed(name: &str) -> bool {
    let mut segments = 0usize;
    for segment in name.split('.') {
        let mut chars = segment.chars();
        let ok = match chars.next() {
            Some(first) if first.is_ascii_lowercase() => chars
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
            _ => false,
        };
        if !ok {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

impl core::fmt::Display for PermissionName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PermissionName {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for PermissionName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Standard actions a module permission can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Manage,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Manage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
        }
    }
}

impl FromStr for Action {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Action::Read),
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "manage" => Ok(Action::Manage),
            other => Err(PermissionError::Malformed(other.to_string())),
        }
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
