//! Strongly-typed identifiers used across the engine.

use std::borrow::{Borrow, Cow};
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Identifier of a feature module (e.g. `"inventory"`).
///
/// Module ids are lowercase ASCII words joined by `-` or `_`. They are the
/// stable key shared by the static catalog, the remote overlay and every
/// activation event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(Cow<'static, str>);

impl ModuleId {
    /// Wrap an id without validation. Registry validation rejects malformed ids.
    pub fn new(id: impl Into<Cow<'static, str>>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an id.
    pub fn parse(id: &str) -> Result<Self, IdError> {
        let candidate = Self(Cow::Owned(id.to_string()));
        if candidate.is_well_formed() {
            Ok(candidate)
        } else {
            Err(IdError::Module(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when the id is non-empty and only uses `[a-z0-9_-]`,
    /// starting with a letter.
    pub fn is_well_formed(&self) -> bool {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(first) if first.is_ascii_lowercase() => chars
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'),
            _ => false,
        }
    }
}

impl core::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ModuleId {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for ModuleId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of an authenticated user (actor identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s).map_err(|e| IdError::User(e.to_string()))?;
        Ok(Self(uuid))
    }
}
