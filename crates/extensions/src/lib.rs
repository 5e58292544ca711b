//! Discovers plugin images, resolves their extension points, and indexes
//! the resulting extensions for lookup by path or contract type.

mod manifest;
mod node;
mod registry;

use std::any::Any;
use std::path::PathBuf;

use thiserror::Error;

pub use manifest::{ADDINS_EXTENSION, AddinsEntry, EntryMatch, expand_entry, parse_addins};
pub use node::{ExtensionFactory, ExtensionNode, ExtensionObject, ExtensionPoint};
pub use registry::{
    COMPATIBLE_ENGINE_VERSION, ExtensionRegistry, TYPE_EXTENSION_PATH_PREFIX, type_extension_path,
};

/// Binds a concrete plugin type to the expected-type name of the
/// extension point it fills.
pub trait ExtensionContract: Any + Send + Sync {
    const EXPECTED_TYPE: &'static str;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to load extension candidate `{path}`: {reason}")]
    ExtensionLoad { path: PathBuf, reason: String },
    #[error("an extension point already exists at path `{path}`")]
    DuplicateExtensionPoint { path: String },
    #[error("no extension point found for `{target}`")]
    NoExtensionPoint { target: String },
    #[error("type `{type_name}` matches multiple extension points: {paths:?}")]
    AmbiguousExtensionPoint {
        type_name: String,
        paths: Vec<String>,
    },
    #[error("host framework `{framework}` cannot load extensions")]
    UnsupportedHost { framework: String },
    #[error("no factory registered for extension type `{type_name}`")]
    MissingFactory { type_name: String },
    #[error("extension discovery already ran for this registry")]
    AlreadyDiscovered,
}
