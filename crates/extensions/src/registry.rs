use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use inspector::{IMAGE_EXTENSION, ImageMetadata, ImageVersion};
use tracing::{debug, info, warn};
use types::{
    FRAMEWORK_ID_NET, FRAMEWORK_ID_NETCORE, FRAMEWORK_ID_NETSTANDARD, FrameworkName, HostRuntime,
};

use crate::manifest::{ADDINS_EXTENSION, expand_entry, read_addins};
use crate::node::{ExtensionFactory, ExtensionNode, ExtensionPoint};
use crate::{ExtensionContract, RegistryError};

/// Highest engine version extensions may require; anything newer is
/// skipped during discovery.
pub const COMPATIBLE_ENGINE_VERSION: ImageVersion = ImageVersion::new(1, 0, 0);

/// Prefix of extension-point paths deduced from a type name.
pub const TYPE_EXTENSION_PATH_PREFIX: &str = "/Engine/TypeExtensions/";

/// Extension points the engine itself defines: the expected contract type
/// and a description. Paths derive from the type name.
const BUILTIN_EXTENSION_POINTS: &[(&str, &str)] = &[
    (
        "engine.api.DriverFactory",
        "Provides drivers for additional test frameworks",
    ),
    (
        "engine.api.AgentLauncher",
        "Builds worker processes for additional target runtimes",
    ),
    (
        "engine.api.TestEventListener",
        "Receives progress events while tests run",
    ),
    (
        "engine.api.ResultWriter",
        "Writes run results in alternate formats",
    ),
    (
        "engine.api.ProjectLoader",
        "Expands project files into test packages",
    ),
];

/// The extension registry: built once at startup, immutable afterwards
/// except for per-node enabled flags and lazily-cached plugin objects.
pub struct ExtensionRegistry {
    host: HostRuntime,
    points: Vec<ExtensionPoint>,
    path_index: HashMap<String, usize>,
    type_index: HashMap<String, usize>,
    factories: BTreeMap<String, ExtensionFactory>,
    discovered: bool,
}

impl ExtensionRegistry {
    /// Creates a registry for the given host runtime, seeded with the
    /// engine's own extension points. A `.NETStandard` host has no
    /// runtime of its own and is refused.
    pub fn new(host: HostRuntime) -> Result<Self, RegistryError> {
        if host.framework.identifier == FRAMEWORK_ID_NETSTANDARD {
            return Err(RegistryError::UnsupportedHost {
                framework: host.framework.to_string(),
            });
        }
        let mut registry = Self {
            host,
            points: Vec::new(),
            path_index: HashMap::new(),
            type_index: HashMap::new(),
            factories: BTreeMap::new(),
            discovered: false,
        };
        for (expected_type, description) in BUILTIN_EXTENSION_POINTS {
            registry.add_type_extension_point(expected_type, Some((*description).to_owned()))?;
        }
        Ok(registry)
    }

    /// Registers an extension point at an explicit path.
    pub fn add_extension_point(
        &mut self,
        path: impl Into<String>,
        expected_type: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), RegistryError> {
        let path = path.into();
        let expected_type = expected_type.into();
        if self.path_index.contains_key(&path) {
            return Err(RegistryError::DuplicateExtensionPoint { path });
        }
        let index = self.points.len();
        self.path_index.insert(path.clone(), index);
        self.type_index.insert(expected_type.clone(), index);
        self.points
            .push(ExtensionPoint::new(path, expected_type, description));
        Ok(())
    }

    /// Registers a type-level extension point; the path defaults to
    /// `/Engine/TypeExtensions/<TypeName>`.
    pub fn add_type_extension_point(
        &mut self,
        expected_type: &str,
        description: Option<String>,
    ) -> Result<(), RegistryError> {
        self.add_extension_point(
            type_extension_path(expected_type),
            expected_type,
            description,
        )
    }

    /// Ingests the extension-point declarations of a root image — the
    /// API-defining assembly of a plugin family.
    pub fn add_root_image(&mut self, path: &Path) -> Result<(), RegistryError> {
        let metadata =
            ImageMetadata::read_from(path).map_err(|source| RegistryError::ExtensionLoad {
                path: path.to_path_buf(),
                reason: source.to_string(),
            })?;
        for declaration in &metadata.extension_points {
            self.add_extension_point(
                declaration.path.clone(),
                declaration.expected_type.clone(),
                declaration.description.clone(),
            )?;
        }
        for entry in &metadata.types {
            if let Some(point) = &entry.extension_point {
                self.add_extension_point(
                    type_extension_path(&entry.name),
                    entry.name.clone(),
                    point.description.clone(),
                )?;
            }
        }
        Ok(())
    }

    /// Registers the constructor for a plugin type name. Nodes naming a
    /// type with no factory fail on first materialization.
    pub fn register_factory(&mut self, type_name: impl Into<String>, factory: ExtensionFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Walks `start_dir` for candidate images and installs every
    /// compatible extension. Runs exactly once per registry.
    pub fn discover(&mut self, start_dir: &Path) -> Result<(), RegistryError> {
        if self.discovered {
            return Err(RegistryError::AlreadyDiscovered);
        }
        self.discovered = true;

        let mut state = DiscoveryState::default();
        self.process_directory(start_dir, false, &mut state)?;
        for candidate in state.arena {
            self.install_candidate(&candidate)?;
        }
        Ok(())
    }

    fn process_directory(
        &self,
        dir: &Path,
        from_wildcard: bool,
        state: &mut DiscoveryState,
    ) -> Result<(), RegistryError> {
        let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect(),
            Err(source) => {
                if from_wildcard {
                    warn!(dir = %dir.display(), error = %source, "skipping unreadable addins directory");
                    return Ok(());
                }
                return Err(RegistryError::ExtensionLoad {
                    path: dir.to_path_buf(),
                    reason: source.to_string(),
                });
            }
        };
        entries.sort();

        let addins_files: Vec<&PathBuf> = entries
            .iter()
            .filter(|path| has_extension(path, ADDINS_EXTENSION))
            .collect();

        // A manifest takes over the directory: only listed paths are
        // processed.
        if !addins_files.is_empty() {
            for addins_file in addins_files {
                debug!(manifest = %addins_file.display(), "processing addins manifest");
                for entry in read_addins(addins_file)? {
                    let tainted = from_wildcard || entry.is_wildcard();
                    for matched in expand_entry(dir, &entry) {
                        if matched.is_directory {
                            if matched.path.is_dir() {
                                self.process_directory(&matched.path, tainted, state)?;
                            } else if tainted {
                                debug!(dir = %matched.path.display(), "wildcard directory match vanished");
                            } else {
                                return Err(RegistryError::ExtensionLoad {
                                    path: matched.path,
                                    reason: "listed directory does not exist".to_owned(),
                                });
                            }
                        } else {
                            self.process_candidate(&matched.path, tainted, state)?;
                        }
                    }
                }
            }
            return Ok(());
        }

        for path in entries {
            if has_extension(&path, IMAGE_EXTENSION) && path.is_file() {
                self.process_candidate(&path, from_wildcard, state)?;
            }
        }
        Ok(())
    }

    fn process_candidate(
        &self,
        path: &Path,
        from_wildcard: bool,
        state: &mut DiscoveryState,
    ) -> Result<(), RegistryError> {
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(source) => {
                return demote_for_wildcard(path, source.to_string(), from_wildcard);
            }
        };
        if !state.visited.insert(canonical.clone()) {
            return Ok(());
        }

        let metadata = match ImageMetadata::read_from(&canonical) {
            Ok(metadata) => metadata,
            Err(source) => {
                return demote_for_wildcard(&canonical, source.to_string(), from_wildcard);
            }
        };

        match state.by_name.get(&metadata.name) {
            Some(&index) => {
                let existing = &state.arena[index];
                if metadata.version > existing.metadata.version {
                    debug!(
                        name = %metadata.name,
                        kept = %metadata.version,
                        dropped = %existing.metadata.version,
                        "duplicate extension assembly, keeping higher version"
                    );
                    state.arena[index] = Candidate {
                        path: canonical,
                        metadata,
                        from_wildcard,
                    };
                } else {
                    debug!(
                        name = %metadata.name,
                        kept = %existing.metadata.version,
                        dropped = %metadata.version,
                        "duplicate extension assembly, keeping higher version"
                    );
                }
            }
            None => {
                state.by_name.insert(metadata.name.clone(), state.arena.len());
                state.arena.push(Candidate {
                    path: canonical,
                    metadata,
                    from_wildcard,
                });
            }
        }
        Ok(())
    }

    fn install_candidate(&mut self, candidate: &Candidate) -> Result<(), RegistryError> {
        let framework = match candidate.metadata.framework_name() {
            Ok(framework) => framework,
            Err(source) => {
                return demote_for_wildcard(
                    &candidate.path,
                    source.to_string(),
                    candidate.from_wildcard,
                );
            }
        };
        if !self.accepts_framework(&framework) {
            warn!(
                assembly = %candidate.path.display(),
                target = %framework,
                host = %self.host.framework,
                "skipping extension assembly targeting an incompatible framework"
            );
            return Ok(());
        }

        for entry in &candidate.metadata.types {
            let Some(declaration) = &entry.extension else {
                continue;
            };
            if let Some(required) = declaration.engine_version
                && required > COMPATIBLE_ENGINE_VERSION
            {
                debug!(
                    type_name = %entry.name,
                    required = %required,
                    compatible = %COMPATIBLE_ENGINE_VERSION,
                    "skipping extension requiring a newer engine"
                );
                continue;
            }

            let point_index = match &declaration.path {
                Some(path) => {
                    *self
                        .path_index
                        .get(path)
                        .ok_or_else(|| RegistryError::NoExtensionPoint {
                            target: path.clone(),
                        })?
                }
                None => self.deduce_point_index(&candidate.metadata, &entry.name)?,
            };

            let node = Arc::new(ExtensionNode::new(
                candidate.path.clone(),
                candidate.metadata.version,
                entry.name.clone(),
                framework.clone(),
                self.points[point_index].path().to_owned(),
                declaration.description.clone(),
                declaration.properties.clone(),
                declaration.enabled,
            ));
            info!(
                type_name = %entry.name,
                point = %self.points[point_index].path(),
                assembly = %candidate.path.display(),
                "installed extension"
            );
            self.points[point_index].install(node);
        }
        Ok(())
    }

    /// Finds the extension point for a type with no explicit path:
    /// identity first, then every interface the type implements
    /// (recursively through the image's type table), then the base chain.
    fn deduce_point_index(
        &self,
        metadata: &ImageMetadata,
        type_name: &str,
    ) -> Result<usize, RegistryError> {
        let mut current = Some(type_name.to_owned());
        while let Some(name) = current {
            if let Some(&index) = self.type_index.get(&name) {
                return Ok(index);
            }

            let matches: BTreeSet<usize> = interface_closure(metadata, &name)
                .iter()
                .filter_map(|interface| self.type_index.get(interface).copied())
                .collect();
            match matches.len() {
                1 => {
                    if let Some(&index) = matches.iter().next() {
                        return Ok(index);
                    }
                }
                0 => {}
                _ => {
                    return Err(RegistryError::AmbiguousExtensionPoint {
                        type_name: type_name.to_owned(),
                        paths: matches
                            .iter()
                            .map(|&index| self.points[index].path().to_owned())
                            .collect(),
                    });
                }
            }

            current = metadata
                .type_entry(&name)
                .and_then(|entry| entry.base.clone());
        }
        Err(RegistryError::NoExtensionPoint {
            target: type_name.to_owned(),
        })
    }

    fn accepts_framework(&self, extension: &FrameworkName) -> bool {
        match self.host.framework.identifier.as_str() {
            FRAMEWORK_ID_NET => matches!(
                extension.identifier.as_str(),
                FRAMEWORK_ID_NET | FRAMEWORK_ID_NETSTANDARD
            ),
            FRAMEWORK_ID_NETCORE => matches!(
                extension.identifier.as_str(),
                FRAMEWORK_ID_NETCORE | FRAMEWORK_ID_NETSTANDARD
            ),
            _ => false,
        }
    }

    pub fn host(&self) -> &HostRuntime {
        &self.host
    }

    pub fn extension_points(&self) -> &[ExtensionPoint] {
        &self.points
    }

    pub fn get_extension_point(&self, path: &str) -> Option<&ExtensionPoint> {
        self.path_index.get(path).map(|&index| &self.points[index])
    }

    pub fn get_extension_point_by_type(&self, expected_type: &str) -> Option<&ExtensionPoint> {
        self.type_index
            .get(expected_type)
            .map(|&index| &self.points[index])
    }

    /// The nodes installed at `path`, in installation order; empty when
    /// the point does not exist.
    pub fn get_extension_nodes<'a>(
        &'a self,
        path: &str,
    ) -> impl Iterator<Item = &'a Arc<ExtensionNode>> + use<'a> {
        self.get_extension_point(path)
            .into_iter()
            .flat_map(|point| point.nodes().iter())
    }

    /// Materialized plugin objects for the enabled nodes at `T`'s
    /// extension point, lazily, in installation order. Nodes whose
    /// concrete type is not `T` are skipped.
    pub fn get_extensions<T: ExtensionContract>(
        &self,
    ) -> impl Iterator<Item = Result<Arc<T>, RegistryError>> {
        self.get_extension_point_by_type(T::EXPECTED_TYPE)
            .into_iter()
            .flat_map(|point| point.nodes().iter())
            .filter(|node| node.is_enabled())
            .filter_map(|node| match node.extension_object(&self.factories) {
                Ok(object) => object.downcast::<T>().ok().map(Ok),
                Err(error) => Some(Err(error)),
            })
    }

    /// Toggles the enabled flag on every node whose type name matches.
    pub fn enable_extension(&self, type_name: &str, enabled: bool) {
        for point in &self.points {
            for node in point.nodes() {
                if node.type_name() == type_name {
                    node.set_enabled(enabled);
                }
            }
        }
    }
}

/// `/Engine/TypeExtensions/<TypeName>` for a possibly-qualified type name.
pub fn type_extension_path(expected_type: &str) -> String {
    let simple_name = expected_type
        .rsplit('.')
        .next()
        .unwrap_or(expected_type);
    format!("{TYPE_EXTENSION_PATH_PREFIX}{simple_name}")
}

#[derive(Debug, Default)]
struct DiscoveryState {
    visited: HashSet<PathBuf>,
    by_name: HashMap<String, usize>,
    arena: Vec<Candidate>,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    metadata: ImageMetadata,
    from_wildcard: bool,
}

/// Wildcard candidates fail softly; explicitly-listed ones fail discovery.
fn demote_for_wildcard(
    path: &Path,
    reason: String,
    from_wildcard: bool,
) -> Result<(), RegistryError> {
    if from_wildcard {
        warn!(path = %path.display(), reason = %reason, "skipping unreadable wildcard candidate");
        Ok(())
    } else {
        Err(RegistryError::ExtensionLoad {
            path: path.to_path_buf(),
            reason,
        })
    }
}

/// Every interface reachable from `type_name` through the image's type
/// table, in breadth-first order.
fn interface_closure(metadata: &ImageMetadata, type_name: &str) -> Vec<String> {
    let mut closure = Vec::new();
    let mut queue: Vec<String> = metadata
        .type_entry(type_name)
        .map(|entry| entry.interfaces.clone())
        .unwrap_or_default();
    while !queue.is_empty() {
        let mut next = Vec::new();
        for interface in queue {
            if closure.contains(&interface) {
                continue;
            }
            if let Some(entry) = metadata.type_entry(&interface) {
                next.extend(entry.interfaces.iter().cloned());
            }
            closure.push(interface);
        }
        queue = next;
    }
    closure
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_points_are_seeded_with_deduced_paths() {
        let registry = ExtensionRegistry::new(HostRuntime::current()).expect("host is supported");
        let point = registry
            .get_extension_point("/Engine/TypeExtensions/AgentLauncher")
            .expect("builtin point should exist");
        assert_eq!(point.expected_type(), "engine.api.AgentLauncher");
        assert!(
            registry
                .get_extension_point_by_type("engine.api.DriverFactory")
                .is_some()
        );
    }

    #[test]
    fn duplicate_paths_are_refused() {
        let mut registry =
            ExtensionRegistry::new(HostRuntime::current()).expect("host is supported");
        let error = registry
            .add_extension_point(
                "/Engine/TypeExtensions/AgentLauncher",
                "another.Type",
                None,
            )
            .expect_err("path is already taken");
        assert!(matches!(
            error,
            RegistryError::DuplicateExtensionPoint { .. }
        ));
    }

    #[test]
    fn netstandard_host_is_an_error() {
        let host = HostRuntime {
            runtime: types::RuntimeId::ANY,
            framework: FrameworkName::new(FRAMEWORK_ID_NETSTANDARD, types::RuntimeVersion::new(2, 0)),
        };
        assert!(matches!(
            ExtensionRegistry::new(host),
            Err(RegistryError::UnsupportedHost { .. })
        ));
    }

    #[test]
    fn type_extension_path_uses_the_simple_name() {
        assert_eq!(
            type_extension_path("engine.api.TestEventListener"),
            "/Engine/TypeExtensions/TestEventListener"
        );
        assert_eq!(
            type_extension_path("Unqualified"),
            "/Engine/TypeExtensions/Unqualified"
        );
    }

    #[test]
    fn missing_point_lookup_is_none_and_nodes_are_empty() {
        let registry = ExtensionRegistry::new(HostRuntime::current()).expect("host is supported");
        assert!(registry.get_extension_point("/Engine/Nope").is_none());
        assert_eq!(registry.get_extension_nodes("/Engine/Nope").count(), 0);
    }
}
