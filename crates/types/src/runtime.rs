use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CLR version shared by every 2.x/3.x .NET Framework runtime.
pub const CLR_V2: RuntimeVersion = RuntimeVersion::with_build(2, 0, 50727);
/// CLR version shared by every 4.x .NET Framework runtime.
pub const CLR_V4: RuntimeVersion = RuntimeVersion::with_build(4, 0, 30319);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFamily {
    Net,
    NetCore,
    Mono,
    Any,
}

impl RuntimeFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeFamily::Net => "net",
            RuntimeFamily::NetCore => "netcore",
            RuntimeFamily::Mono => "mono",
            RuntimeFamily::Any => "any",
        }
    }
}

impl fmt::Display for RuntimeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeFamily {
    type Err = RuntimeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "net" => Ok(RuntimeFamily::Net),
            "netcore" => Ok(RuntimeFamily::NetCore),
            "mono" => Ok(RuntimeFamily::Mono),
            "any" => Ok(RuntimeFamily::Any),
            _ => Err(RuntimeIdError::UnsupportedRuntime {
                value: value.to_owned(),
            }),
        }
    }
}

/// A two- or three-component runtime version. The build component is unset
/// for framework versions and set for CLR versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<u32>,
}

impl RuntimeVersion {
    /// The wildcard version: matches every concrete version.
    pub const ANY: RuntimeVersion = RuntimeVersion::new(0, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            build: None,
        }
    }

    pub const fn with_build(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build: Some(build),
        }
    }

    pub fn is_any(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// Component-wise equality, ignoring components unset on either side.
    pub fn matches(&self, other: &RuntimeVersion) -> bool {
        if self.major != other.major || self.minor != other.minor {
            return false;
        }
        match (self.build, other.build) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.build {
            Some(build) => write!(f, "{}.{}.{}", self.major, self.minor, build),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl FromStr for RuntimeVersion {
    type Err = RuntimeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || RuntimeIdError::MalformedVersion {
            value: value.to_owned(),
        };
        let mut components = value.split('.');
        let major = components
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(malformed)?
            .parse()
            .map_err(|_| malformed())?;
        let minor = components
            .next()
            .ok_or_else(malformed)?
            .parse()
            .map_err(|_| malformed())?;
        let build = match components.next() {
            Some(component) => Some(component.parse().map_err(|_| malformed())?),
            None => None,
        };
        if components.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            major,
            minor,
            build,
        })
    }
}

/// Canonical identity of a managed runtime: a family plus a framework
/// version and the CLR version it implies.
///
/// Parsing accepts a bare family name (`"net"`), a `v`-prefixed version
/// (`"v4.5"`, family `any`), or the hyphenated form (`"net-4.0"`). A
/// three-component version is interpreted as a CLR version and mapped to
/// its framework version through the per-family table; two components are
/// a framework version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeId {
    pub family: RuntimeFamily,
    pub framework_version: RuntimeVersion,
    pub clr_version: RuntimeVersion,
}

impl RuntimeId {
    /// The id that matches every concrete runtime.
    pub const ANY: RuntimeId = RuntimeId {
        family: RuntimeFamily::Any,
        framework_version: RuntimeVersion::ANY,
        clr_version: RuntimeVersion::ANY,
    };

    /// Builds an id from a family and a version of either shape: a
    /// three-component version is taken as a CLR version, anything else as
    /// a framework version.
    pub fn new(family: RuntimeFamily, version: RuntimeVersion) -> Self {
        if version.build.is_some() {
            Self {
                family,
                framework_version: framework_from_clr(family, version),
                clr_version: version,
            }
        } else {
            Self {
                family,
                framework_version: version,
                clr_version: clr_from_framework(family, version),
            }
        }
    }

    pub fn parse(value: &str) -> Result<Self, RuntimeIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RuntimeIdError::UnsupportedRuntime {
                value: value.to_owned(),
            });
        }

        if let Some(version_text) = trimmed.strip_prefix('v') {
            let version = version_text.parse()?;
            return Ok(Self::new(RuntimeFamily::Any, version));
        }

        match trimmed.split_once('-') {
            Some((family_text, version_text)) => {
                let family = family_text.parse()?;
                let version = version_text.parse()?;
                Ok(Self::new(family, version))
            }
            None => {
                let family = trimmed.parse()?;
                Ok(Self::new(family, RuntimeVersion::ANY))
            }
        }
    }

    pub fn is_any_version(&self) -> bool {
        self.framework_version.is_any()
    }

    /// True when a runtime of this id can host a test binary targeting
    /// `target`.
    ///
    /// Families must agree unless either side is `any`; a wildcard version
    /// on either side matches; otherwise the CLR versions must match
    /// component-wise (unset components ignored) and this framework
    /// version must be at least the target's in both major and minor.
    pub fn supports(&self, target: &RuntimeId) -> bool {
        if self.family != RuntimeFamily::Any
            && target.family != RuntimeFamily::Any
            && self.family != target.family
        {
            return false;
        }
        if self.is_any_version() || target.is_any_version() {
            return true;
        }
        self.clr_version.matches(&target.clr_version)
            && self.framework_version.major >= target.framework_version.major
            && self.framework_version.minor >= target.framework_version.minor
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any_version() {
            write!(f, "{}", self.family)
        } else {
            write!(
                f,
                "{}-{}.{}",
                self.family, self.framework_version.major, self.framework_version.minor
            )
        }
    }
}

impl FromStr for RuntimeId {
    type Err = RuntimeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

fn clr_from_framework(family: RuntimeFamily, framework: RuntimeVersion) -> RuntimeVersion {
    match family {
        RuntimeFamily::Net | RuntimeFamily::Mono | RuntimeFamily::Any => match framework.major {
            0 if framework.is_any() => RuntimeVersion::ANY,
            2 | 3 => CLR_V2,
            4 => CLR_V4,
            _ => framework,
        },
        RuntimeFamily::NetCore => framework,
    }
}

fn framework_from_clr(family: RuntimeFamily, clr: RuntimeVersion) -> RuntimeVersion {
    match family {
        RuntimeFamily::Net | RuntimeFamily::Mono | RuntimeFamily::Any => {
            if clr == CLR_V2 {
                RuntimeVersion::new(2, 0)
            } else if clr == CLR_V4 {
                RuntimeVersion::new(4, 0)
            } else {
                RuntimeVersion::new(clr.major, clr.minor)
            }
        }
        RuntimeFamily::NetCore => RuntimeVersion::new(clr.major, clr.minor),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeIdError {
    #[error("unsupported runtime `{value}`")]
    UnsupportedRuntime { value: String },
    #[error("malformed runtime version `{value}`")]
    MalformedVersion { value: String },
    #[error("malformed target framework name `{value}`")]
    MalformedFrameworkName { value: String },
}

pub const FRAMEWORK_ID_NET: &str = ".NETFramework";
pub const FRAMEWORK_ID_NETCORE: &str = ".NETCoreApp";
pub const FRAMEWORK_ID_NETSTANDARD: &str = ".NETStandard";

/// A target-framework moniker of the form
/// `"<Identifier>,Version=v<major>.<minor>"`, as declared in an image
/// header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkName {
    pub identifier: String,
    pub version: RuntimeVersion,
}

impl FrameworkName {
    pub fn new(identifier: impl Into<String>, version: RuntimeVersion) -> Self {
        Self {
            identifier: identifier.into(),
            version,
        }
    }

    pub fn parse(value: &str) -> Result<Self, RuntimeIdError> {
        let malformed = || RuntimeIdError::MalformedFrameworkName {
            value: value.to_owned(),
        };
        let (identifier, rest) = value.split_once(',').ok_or_else(malformed)?;
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(malformed());
        }
        // Only the Version pair is significant; a trailing Profile pair is
        // tolerated and ignored.
        let version_pair = rest
            .split(',')
            .map(str::trim)
            .find_map(|pair| pair.strip_prefix("Version="))
            .ok_or_else(malformed)?;
        let version_text = version_pair.strip_prefix('v').ok_or_else(malformed)?;
        let version = version_text.parse()?;
        Ok(Self {
            identifier: identifier.to_owned(),
            version,
        })
    }

    /// Maps the moniker onto a runtime id. `.NETStandard` has no runtime
    /// of its own and is refused.
    pub fn to_runtime_id(&self) -> Result<RuntimeId, RuntimeIdError> {
        let family = match self.identifier.as_str() {
            FRAMEWORK_ID_NET => RuntimeFamily::Net,
            FRAMEWORK_ID_NETCORE => RuntimeFamily::NetCore,
            "Mono" => RuntimeFamily::Mono,
            _ => {
                return Err(RuntimeIdError::UnsupportedRuntime {
                    value: self.to_string(),
                });
            }
        };
        Ok(RuntimeId::new(
            family,
            RuntimeVersion::new(self.version.major, self.version.minor),
        ))
    }
}

impl fmt::Display for FrameworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},Version=v{}.{}",
            self.identifier, self.version.major, self.version.minor
        )
    }
}

/// The runtime the engine's own process presents to the registry and the
/// agency. Computed once at startup and threaded into constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRuntime {
    pub runtime: RuntimeId,
    pub framework: FrameworkName,
}

impl HostRuntime {
    /// The engine hosts plugins as a `netcore`-family runtime.
    pub fn current() -> Self {
        let version = RuntimeVersion::new(3, 1);
        Self {
            runtime: RuntimeId::new(RuntimeFamily::NetCore, version),
            framework: FrameworkName::new(FRAMEWORK_ID_NETCORE, version),
        }
    }
}
