use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Names of the settings the engine itself recognizes. Anything else is
/// carried opaquely for the framework's benefit.
pub mod settings {
    pub const TARGET_RUNTIME_FRAMEWORK: &str = "TargetRuntimeFramework";
    pub const IMAGE_TARGET_FRAMEWORK_NAME: &str = "ImageTargetFrameworkName";
    pub const IMAGE_TEST_FRAMEWORK_REFERENCE: &str = "ImageTestFrameworkReference";
    pub const IMAGE_REQUIRES_X86: &str = "ImageRequiresX86";
    pub const RUN_AS_X86: &str = "RunAsX86";
    pub const DEBUG_TESTS: &str = "DebugTests";
    pub const DEBUG_AGENT: &str = "DebugAgent";
    pub const INTERNAL_TRACE_LEVEL: &str = "InternalTraceLevel";
    pub const LOAD_USER_PROFILE: &str = "LoadUserProfile";
    pub const WORK_DIRECTORY: &str = "WorkDirectory";
    pub const SKIP_NON_TEST_ASSEMBLIES: &str = "SkipNonTestAssemblies";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(value) => Some(*value),
            SettingValue::Text(value) => value.parse().ok(),
            SettingValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(value) => Some(*value),
            SettingValue::Text(value) => value.parse().ok(),
            SettingValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(value) => write!(f, "{value}"),
            SettingValue::Int(value) => write!(f, "{value}"),
            SettingValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_owned())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

/// A request to execute one or more test binaries.
///
/// A package is either a *leaf* (a single binary path) or an *aggregate*
/// (an ordered list of sub-packages); the constructors are the only way to
/// build one, so the two shapes cannot be mixed. Settings written on a
/// package propagate to its sub-packages; a setting written later on a
/// sub-package overrides the inherited value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPackage {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    full_name: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sub_packages: Vec<TestPackage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    settings: BTreeMap<String, SettingValue>,
}

impl TestPackage {
    /// A leaf package for a single test binary.
    pub fn new(full_name: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            full_name: Some(full_name.into()),
            sub_packages: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// An aggregate package wrapping one leaf sub-package per path, in the
    /// given order.
    pub fn aggregate(full_names: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            full_name: None,
            sub_packages: full_names.into_iter().map(TestPackage::new).collect(),
            settings: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn full_name(&self) -> Option<&Path> {
        self.full_name.as_deref()
    }

    pub fn is_leaf(&self) -> bool {
        self.full_name.is_some()
    }

    pub fn sub_packages(&self) -> &[TestPackage] {
        &self.sub_packages
    }

    /// The leaf packages of this tree in order; a leaf yields itself.
    pub fn leaves(&self) -> Vec<&TestPackage> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, into: &mut Vec<&'a TestPackage>) {
        if self.is_leaf() {
            into.push(self);
        }
        for sub_package in &self.sub_packages {
            sub_package.collect_leaves(into);
        }
    }

    /// Mutable access to the leaf packages, in the same order as
    /// [`TestPackage::leaves`].
    pub fn leaves_mut(&mut self) -> Vec<&mut TestPackage> {
        let mut leaves = Vec::new();
        self.collect_leaves_mut(&mut leaves);
        leaves
    }

    fn collect_leaves_mut<'a>(&'a mut self, into: &mut Vec<&'a mut TestPackage>) {
        if self.is_leaf() {
            into.push(self);
            return;
        }
        for sub_package in &mut self.sub_packages {
            sub_package.collect_leaves_mut(into);
        }
    }

    /// Sets a setting on this package and every package below it.
    pub fn add_setting(&mut self, name: impl Into<String>, value: impl Into<SettingValue>) {
        let name = name.into();
        let value = value.into();
        for sub_package in &mut self.sub_packages {
            sub_package.add_setting(name.clone(), value.clone());
        }
        self.settings.insert(name, value);
    }

    pub fn settings(&self) -> &BTreeMap<String, SettingValue> {
        &self.settings
    }

    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.settings.get(name)
    }

    pub fn setting_str(&self, name: &str) -> Option<&str> {
        self.setting(name).and_then(SettingValue::as_str)
    }

    pub fn setting_bool(&self, name: &str) -> bool {
        self.setting(name)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false)
    }

    pub fn setting_int(&self, name: &str) -> Option<i64> {
        self.setting(name).and_then(SettingValue::as_int)
    }
}
