//! Reads the metadata of test binaries and plugin images without loading
//! them, and reports what the engine needs for agent selection and driver
//! dispatch.

mod image;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use types::{FrameworkName, RuntimeId, RuntimeIdError};

pub use image::{
    ExtensionDecl, ExtensionPointDecl, IMAGE_EXTENSION, IMAGE_MAGIC, ImageMetadata, ImageVersion,
    MAX_HEADER_BYTES, TypeEntry, TypeExtensionPointDecl, read_image_body, write_image,
};

/// Test frameworks the engine knows how to drive, matched against an
/// image's references case-insensitively.
pub const KNOWN_TEST_FRAMEWORKS: &[&str] = &["nunit.framework"];

/// Framework identifiers the engine refuses outright.
pub const REJECTED_PLATFORMS: &[&str] = &[
    "Silverlight",
    ".NETPortable",
    ".NETStandard",
    ".NETCompactFramework",
];

/// What the inspector learned about one test binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub path: PathBuf,
    pub image_name: String,
    pub target_framework: FrameworkName,
    pub target_runtime: RuntimeId,
    pub requires_x86: bool,
    pub references: Vec<String>,
    /// The reference that named a known test framework, verbatim.
    pub test_framework_reference: Option<String>,
}

/// Inspects the binary at `path`: reads its header, refuses rejected
/// platforms, and maps the declared target framework onto a runtime id.
pub fn inspect(path: &Path) -> Result<ImageReport, InspectError> {
    let metadata = ImageMetadata::read_from(path)?;
    let target_framework =
        metadata
            .framework_name()
            .map_err(|source| InspectError::BadBinary {
                path: path.to_path_buf(),
                reason: source.to_string(),
            })?;

    if REJECTED_PLATFORMS.contains(&target_framework.identifier.as_str()) {
        return Err(InspectError::UnsupportedPlatform {
            path: path.to_path_buf(),
            platform: target_framework.identifier,
        });
    }

    let target_runtime = target_framework.to_runtime_id()?;
    let test_framework_reference = metadata
        .references
        .iter()
        .find(|reference| {
            KNOWN_TEST_FRAMEWORKS
                .iter()
                .any(|known| reference.eq_ignore_ascii_case(known))
        })
        .cloned();

    Ok(ImageReport {
        path: path.to_path_buf(),
        image_name: metadata.name,
        target_framework,
        target_runtime,
        requires_x86: metadata.requires_x86,
        references: metadata.references,
        test_framework_reference,
    })
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("bad binary `{path}`: {reason}")]
    BadBinary { path: PathBuf, reason: String },
    #[error("binary `{path}` targets unsupported platform `{platform}`")]
    UnsupportedPlatform { path: PathBuf, platform: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeIdError),
}

impl InspectError {
    fn bad_binary(path: &Path, source: io::Error) -> Self {
        InspectError::BadBinary {
            path: path.to_path_buf(),
            reason: source.to_string(),
        }
    }
}
