use std::collections::BTreeSet;

use crate::{PermissionError, PermissionName};

/// Closed set of permission names the client understands.
///
/// Derived from the module registry. Server-provided names outside the
/// vocabulary are treated as typos or as permissions for features this client
/// does not ship, and never reach the activation resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionVocabulary {
    names: BTreeSet<PermissionName>,
}

impl PermissionVocabulary {
    pub fn new(names: impl IntoIterator<Item = PermissionName>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, name: PermissionName) {
        self.names.insert(name);
    }

    pub fn contains(&self, name: &PermissionName) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionName> {
        self.names.iter()
    }

    /// Parse `raw` and check it belongs to the vocabulary.
    pub fn validate(&self, raw: &str) -> Result<PermissionName, PermissionError> {
        let name = PermissionName::parse(raw)?;
        if self.names.contains(&name) {
            Ok(name)
        } else {
            Err(PermissionError::Unknown(raw.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_distinguishes_malformed_from_unknown() {
        let vocab = PermissionVocabulary::new([PermissionName::from_static("inventory.read")]);

        assert!(vocab.validate("inventory.read").is_ok());
        assert!(matches!(
            vocab.validate("inventroy.read"),
            Err(PermissionError::Unknown(_))
        ));
        assert!(matches!(
            vocab.validate("inventory"),
            Err(PermissionError::Malformed(_))
        ));
    }
}
