//! Test-group manifest.
//!
//! The image builder's suites are described in a versioned JSON file mapping
//! group names to command-line test cases:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "groups": {
//!     "entry": [
//!       { "name": "testEntryContents", "argv": ["python3", "tools/fwimage/main.py", "-t", "testEntryContents"] }
//!     ]
//!   }
//! }
//! ```
//!
//! Relative `cwd` values resolve against the manifest's directory.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::CommandSpec;
use crate::suite::{GroupKind, TestCase, TestGroup};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read test manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid test manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported test manifest schema_version {found} (expected {SCHEMA_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("unknown test group '{0}'")]
    UnknownGroup(String),
    #[error("test '{name}' appears twice in group '{group}'")]
    DuplicateCase { group: GroupKind, name: String },
    #[error("test '{name}' in group '{group}' has an empty command")]
    EmptyCommand { group: GroupKind, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestCase {
    pub name: String,
    #[serde(flatten)]
    pub command: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<ManifestCase>>,
}

impl TestManifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.schema_version,
            });
        }
        for (group_name, cases) in &self.groups {
            let group = GroupKind::from_str_loose(group_name)
                .ok_or_else(|| ManifestError::UnknownGroup(group_name.clone()))?;
            let mut seen = BTreeSet::new();
            for case in cases {
                if !seen.insert(case.name.as_str()) {
                    return Err(ManifestError::DuplicateCase {
                        group,
                        name: case.name.clone(),
                    });
                }
                if case.command.argv.is_empty() {
                    return Err(ManifestError::EmptyCommand {
                        group,
                        name: case.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Build all five groups in run order. Groups absent from the manifest
    /// come back empty.
    #[must_use]
    pub fn into_groups(self, base_dir: &Path) -> Vec<TestGroup> {
        let mut by_kind: BTreeMap<GroupKind, Vec<ManifestCase>> = BTreeMap::new();
        for (name, cases) in self.groups {
            // validate() already rejected unknown names.
            if let Some(kind) = GroupKind::from_str_loose(&name) {
                by_kind.entry(kind).or_default().extend(cases);
            }
        }

        GroupKind::ALL
            .into_iter()
            .map(|kind| {
                let mut group = TestGroup::new(kind);
                for case in by_kind.remove(&kind).unwrap_or_default() {
                    group.push(TestCase::command(case.name, case.command.rebased(base_dir)));
                }
                group
            })
            .collect()
    }
}

/// Load the manifest at `path` and build the groups it describes.
pub fn load_groups(path: &Path) -> Result<Vec<TestGroup>, ManifestError> {
    let manifest = TestManifest::from_file(path)?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    Ok(manifest.into_groups(base_dir))
}
