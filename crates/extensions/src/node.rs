use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use inspector::ImageVersion;
use types::FrameworkName;

use crate::RegistryError;

/// A materialized plugin instance, downcastable to its concrete type.
pub type ExtensionObject = Arc<dyn Any + Send + Sync>;

/// Constructor for a plugin type; invoked with no arguments, at most once
/// per node.
pub type ExtensionFactory = Box<dyn Fn() -> ExtensionObject + Send + Sync>;

/// A registered extension: where it came from, where it plugs in, and the
/// lazily-built plugin object.
///
/// The node itself is immutable after discovery except for the `enabled`
/// flag and the cached object, each behind its own guard.
pub struct ExtensionNode {
    assembly_path: PathBuf,
    assembly_version: ImageVersion,
    type_name: String,
    target_framework: FrameworkName,
    path: String,
    description: Option<String>,
    properties: BTreeMap<String, Vec<String>>,
    enabled: AtomicBool,
    object: Mutex<Option<ExtensionObject>>,
}

impl ExtensionNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        assembly_path: PathBuf,
        assembly_version: ImageVersion,
        type_name: String,
        target_framework: FrameworkName,
        path: String,
        description: Option<String>,
        properties: BTreeMap<String, Vec<String>>,
        enabled: bool,
    ) -> Self {
        Self {
            assembly_path,
            assembly_version,
            type_name,
            target_framework,
            path,
            description,
            properties,
            enabled: AtomicBool::new(enabled),
            object: Mutex::new(None),
        }
    }

    pub fn assembly_path(&self) -> &Path {
        &self.assembly_path
    }

    pub fn assembly_version(&self) -> ImageVersion {
        self.assembly_version
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn target_framework(&self) -> &FrameworkName {
        &self.target_framework
    }

    /// The extension-point path this node is installed at.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, Vec<String>> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> &[String] {
        self.properties.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The plugin object for this node. The first call constructs it via
    /// the registered factory; later calls return the same instance.
    pub fn extension_object(
        &self,
        factories: &BTreeMap<String, ExtensionFactory>,
    ) -> Result<ExtensionObject, RegistryError> {
        let mut cached = self
            .object
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cached.as_ref() {
            return Ok(existing.clone());
        }
        let factory =
            factories
                .get(&self.type_name)
                .ok_or_else(|| RegistryError::MissingFactory {
                    type_name: self.type_name.clone(),
                })?;
        let object = factory();
        *cached = Some(object.clone());
        Ok(object)
    }
}

impl fmt::Debug for ExtensionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionNode")
            .field("assembly_path", &self.assembly_path)
            .field("assembly_version", &self.assembly_version)
            .field("type_name", &self.type_name)
            .field("path", &self.path)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// A named slot extensions plug into. Paths are unique across the
/// registry; nodes keep installation order.
#[derive(Debug)]
pub struct ExtensionPoint {
    path: String,
    expected_type: String,
    description: Option<String>,
    nodes: Vec<Arc<ExtensionNode>>,
}

impl ExtensionPoint {
    pub(crate) fn new(
        path: impl Into<String>,
        expected_type: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            expected_type: expected_type.into(),
            description,
            nodes: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn expected_type(&self) -> &str {
        &self.expected_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn nodes(&self) -> &[Arc<ExtensionNode>] {
        &self.nodes
    }

    pub(crate) fn install(&mut self, node: Arc<ExtensionNode>) {
        self.nodes.push(node);
    }
}
