//! Option catalog: the static label → group mapping offered to new members.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::messages::Messages;
use super::model::GroupId;
use crate::error::ConfigError;

/// One selectable option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOption {
    pub label: String,
    pub group_id: GroupId,
}

impl GroupOption {
    pub fn new(label: impl Into<String>, group_id: impl Into<GroupId>) -> Self {
        Self {
            label: label.into(),
            group_id: group_id.into(),
        }
    }
}

/// On-disk layout of the catalog file.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    options: Vec<GroupOption>,
    #[serde(default)]
    messages: Option<Messages>,
}

/// Ordered, validated, immutable set of options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionCatalog {
    options: Vec<GroupOption>,
}

impl OptionCatalog {
    /// Build a catalog, rejecting empty catalogs, empty labels and duplicate ids.
    pub fn from_options(options: Vec<GroupOption>) -> Result<Self, ConfigError> {
        if options.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        let mut seen = HashSet::with_capacity(options.len());
        for option in &options {
            if option.label.trim().is_empty() {
                return Err(ConfigError::EmptyLabel(option.group_id.clone()));
            }
            if !seen.insert(&option.group_id) {
                return Err(ConfigError::DuplicateOption(option.group_id.clone()));
            }
        }
        Ok(Self { options })
    }

    /// Load the catalog file. Returns the catalog plus any message overrides
    /// found alongside it.
    pub fn load(path: &Path) -> Result<(Self, Option<Messages>), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: CatalogFile =
            serde_json::from_str(&raw).map_err(|e| ConfigError::CatalogParse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let catalog = Self::from_options(file.options)?;
        tracing::debug!(path = %path.display(), options = catalog.len(), "Loaded option catalog");
        Ok((catalog, file.messages))
    }

    pub fn options(&self) -> &[GroupOption] {
        &self.options
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.options.iter().any(|o| &o.group_id == group_id)
    }

    /// Every group id this catalog governs.
    pub fn group_ids(&self) -> BTreeSet<GroupId> {
        self.options.iter().map(|o| o.group_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
