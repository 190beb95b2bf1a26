//! Entry-type plugin discovery.
//!
//! Plugins live one per file in the `etype/` directory of the image builder.
//! A plugin's name is its file stem. Names containing [`TESTING_MARKER`] are
//! scaffolding used only by the test suite and are not real entry types.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Substring that marks a plugin as test scaffolding.
pub const TESTING_MARKER: &str = "_testing";

/// File extension of plugin sources.
pub const DEFAULT_PLUGIN_EXTENSION: &str = "py";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("plugin directory not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to scan plugin directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("duplicate plugin name '{name}': {} and {}", first.display(), second.display())]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// One entry-type plugin source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginModule {
    pub name: String,
    pub path: PathBuf,
}

impl PluginModule {
    /// Build a module from its source path; `None` if the path has no stem.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_stem()?.to_str()?.to_string();
        Some(Self { name, path })
    }

    #[must_use]
    pub fn is_testing(&self) -> bool {
        self.name.contains(TESTING_MARKER)
    }
}

/// Scan `dir` for plugin sources with the given extension, sorted by name.
pub fn scan_modules(dir: &Path, extension: &str) -> Result<Vec<PluginModule>, DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            DiscoveryError::NotFound {
                path: dir.to_path_buf(),
            }
        } else {
            DiscoveryError::Io {
                path: dir.to_path_buf(),
                source,
            }
        }
    })?;

    let mut modules = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        if let Some(module) = PluginModule::from_path(path) {
            modules.push(module);
        }
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(modules)
}

/// Names of the plugin modules in `dir`.
///
/// Testing-marked modules are dropped unless `include_testing` is set. A
/// missing directory is [`DiscoveryError::NotFound`], never an empty set.
pub fn discover(dir: &Path, include_testing: bool) -> Result<BTreeSet<String>, DiscoveryError> {
    discover_with_extension(dir, DEFAULT_PLUGIN_EXTENSION, include_testing)
}

pub fn discover_with_extension(
    dir: &Path,
    extension: &str,
    include_testing: bool,
) -> Result<BTreeSet<String>, DiscoveryError> {
    Ok(scan_modules(dir, extension)?
        .into_iter()
        .filter(|module| include_testing || !module.is_testing())
        .map(|module| module.name)
        .collect())
}

/// Plugins known to this run, built once at startup.
///
/// Coverage and documentation derive their module sets from here instead of
/// rescanning the filesystem.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    modules: BTreeMap<String, PluginModule>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a registry from one discovery pass over `dir`.
    pub fn scan(dir: &Path, extension: &str) -> Result<Self, DiscoveryError> {
        let mut registry = Self::new();
        for module in scan_modules(dir, extension)? {
            registry.register(module)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, module: PluginModule) -> Result<(), DiscoveryError> {
        if let Some(existing) = self.modules.get(&module.name) {
            return Err(DiscoveryError::DuplicateName {
                name: module.name,
                first: existing.path.clone(),
                second: module.path,
            });
        }
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PluginModule> {
        self.modules.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginModule> {
        self.modules.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn names(&self, include_testing: bool) -> BTreeSet<String> {
        self.modules
            .values()
            .filter(|module| include_testing || !module.is_testing())
            .map(|module| module.name.clone())
            .collect()
    }

    /// Modules that must each show up in the coverage report.
    #[must_use]
    pub fn required_modules(&self) -> BTreeSet<String> {
        self.names(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_is_file_stem() {
        let module = PluginModule::from_path("/src/etype/blob_ext.py").unwrap();
        assert_eq!(module.name, "blob_ext");
        assert!(!module.is_testing());
        assert!(
            PluginModule::from_path("/src/etype/_testing.py")
                .unwrap()
                .is_testing()
        );
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginModule::from_path("a/fill.py").unwrap())
            .unwrap();
        let err = registry
            .register(PluginModule::from_path("b/fill.py").unwrap())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateName { ref name, .. } if name == "fill"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn required_modules_skip_testing_scaffolds() {
        let mut registry = PluginRegistry::new();
        for path in ["e/section.py", "e/_testing.py", "e/fill.py", "e/x_testing_y.py"] {
            registry.register(PluginModule::from_path(path).unwrap()).unwrap();
        }
        let required: Vec<_> = registry.required_modules().into_iter().collect();
        assert_eq!(required, ["fill", "section"]);
        assert_eq!(registry.names(true).len(), 4);
    }

    #[test]
    fn missing_directory_is_not_found() {
        let err = discover(Path::new("/nonexistent/fwimage/etype"), false).unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound { .. }));
    }
}
