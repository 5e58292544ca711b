use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use types::{FrameworkName, RuntimeIdError};

use crate::InspectError;

/// Leading magic of every image file.
pub const IMAGE_MAGIC: [u8; 4] = *b"GIMG";
/// File extension shared by test binaries, framework images and plugin
/// images.
pub const IMAGE_EXTENSION: &str = "gimg";
/// Upper bound on the metadata header; a larger length prefix means the
/// file is not an image.
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Three-component image version used for dedup-by-version and the engine
/// compatibility gate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ImageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ImageVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ImageVersion {
    type Err = RuntimeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || RuntimeIdError::MalformedVersion {
            value: value.to_owned(),
        };
        let components: Vec<u32> = value
            .split('.')
            .map(|component| component.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| malformed())?;
        match components.as_slice() {
            [major, minor, patch] => Ok(Self {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => Err(malformed()),
        }
    }
}

/// An extension declaration attached to a type entry: the named arguments
/// of the extension marker plus its property markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtensionDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<ImageVersion>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Vec<String>>,
}

/// A type-level extension-point declaration; the path defaults to
/// `/Engine/TypeExtensions/<TypeName>` when the registry ingests it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TypeExtensionPointDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An assembly-level extension-point declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPointDecl {
    pub path: String,
    pub expected_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One entry of an image's type table. Images declare their type graph
/// here — interface lists and base types — which is what the registry
/// walks when it deduces an extension's path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_point: Option<TypeExtensionPointDecl>,
}

impl TypeEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            base: None,
            extension: None,
            extension_point: None,
        }
    }
}

/// The metadata header of an image: everything the engine can learn about
/// a binary without loading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub name: String,
    #[serde(default)]
    pub version: ImageVersion,
    pub target_framework: String,
    #[serde(default)]
    pub requires_x86: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_points: Vec<ExtensionPointDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_type: Option<String>,
}

impl ImageMetadata {
    pub fn new(name: impl Into<String>, target_framework: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: ImageVersion::default(),
            target_framework: target_framework.into(),
            requires_x86: false,
            references: Vec::new(),
            types: Vec::new(),
            extension_points: Vec::new(),
            controller_type: None,
        }
    }

    /// Reads only the header of the image at `path`; the body is not
    /// touched.
    pub fn read_from(path: &Path) -> Result<Self, InspectError> {
        let mut file = File::open(path).map_err(|source| InspectError::bad_binary(path, source))?;
        Self::read_header(path, &mut file)
    }

    fn read_header(path: &Path, reader: &mut impl Read) -> Result<Self, InspectError> {
        let mut magic = [0_u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|source| InspectError::bad_binary(path, source))?;
        if magic != IMAGE_MAGIC {
            return Err(InspectError::BadBinary {
                path: path.to_path_buf(),
                reason: "missing image magic".to_owned(),
            });
        }
        let mut length_bytes = [0_u8; 4];
        reader
            .read_exact(&mut length_bytes)
            .map_err(|source| InspectError::bad_binary(path, source))?;
        let header_length = u32::from_be_bytes(length_bytes) as usize;
        if header_length > MAX_HEADER_BYTES {
            return Err(InspectError::BadBinary {
                path: path.to_path_buf(),
                reason: format!("header length {header_length} exceeds {MAX_HEADER_BYTES}"),
            });
        }
        let mut header = vec![0_u8; header_length];
        reader
            .read_exact(&mut header)
            .map_err(|source| InspectError::bad_binary(path, source))?;
        serde_json::from_slice(&header).map_err(|source| InspectError::BadBinary {
            path: path.to_path_buf(),
            reason: format!("malformed metadata header: {source}"),
        })
    }

    pub fn framework_name(&self) -> Result<FrameworkName, RuntimeIdError> {
        FrameworkName::parse(&self.target_framework)
    }

    pub fn type_entry(&self, name: &str) -> Option<&TypeEntry> {
        self.types.iter().find(|entry| entry.name == name)
    }
}

/// Reads the body of an image — the part after the header. For a test
/// binary this is the framework's test manifest; the inspector itself
/// never interprets it.
pub fn read_image_body(path: &Path) -> Result<Vec<u8>, InspectError> {
    let mut file = File::open(path).map_err(|source| InspectError::bad_binary(path, source))?;
    // Consume the header to find where the body starts.
    ImageMetadata::read_header(path, &mut file)?;
    let mut body = Vec::new();
    file.read_to_end(&mut body)
        .map_err(|source| InspectError::bad_binary(path, source))?;
    Ok(body)
}

/// Writes a complete image file: magic, header length, header, body.
/// Fixture and packaging tooling; the engine itself only reads.
pub fn write_image(path: &Path, metadata: &ImageMetadata, body: &[u8]) -> std::io::Result<()> {
    let header = serde_json::to_vec(metadata)?;
    let mut file = File::create(path)?;
    file.write_all(&IMAGE_MAGIC)?;
    file.write_all(&(header.len() as u32).to_be_bytes())?;
    file.write_all(&header)?;
    file.write_all(body)?;
    Ok(())
}

fn default_true() -> bool {
    true
}
