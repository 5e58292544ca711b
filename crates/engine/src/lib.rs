//! The controller side of the engine: runtime-aware agent launchers, the
//! agency that spawns and reclaims workers, the extension registry wiring,
//! and the package runner that drives drivers across the transport.

mod agency;
mod filter;
mod launcher;
mod proxy;
mod runner;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use extensions::{ExtensionRegistry, RegistryError};
use inspector::InspectError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::{HostRuntime, TestPackage};

pub use agency::{
    AgencyConfig, AgencyError, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_STOP_TIMEOUT, TestAgency,
    WorkerExit,
};
pub use filter::{TestFilterBuilder, xml_escape};
pub use launcher::{
    AGENT_EXECUTABLE_ENV_KEY, AgentLauncher, AgentProcessSpec, DEFAULT_AGENT_EXECUTABLE,
    Net20AgentLauncher, Net40AgentLauncher, Net50AgentLauncher, NetCore21AgentLauncher,
    NetCore31AgentLauncher, default_launchers, resolve_agent_executable,
};
pub use proxy::{NullListener, RecordingListener, TestAgent, TestEventListener};
pub use runner::{RunSummary, TestRunner, xml_attr};

/// Engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Directory scanned for extension images at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_dir: Option<PathBuf>,
    /// Directory for per-agent control sockets; a process-scoped temp
    /// directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    /// Worker executable override; the usual resolution applies when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<u64>,
}

pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, EngineError> {
    let path = path.as_ref().to_path_buf();
    let contents = fs::read_to_string(&path).map_err(|source| EngineError::ReadConfig {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| EngineError::ParseConfig { path, source })
}

/// The assembled engine: host runtime, extension registry, and agency.
pub struct TestEngine {
    host: HostRuntime,
    registry: ExtensionRegistry,
    agency: Arc<TestAgency>,
}

impl TestEngine {
    /// Builds the engine: computes the host runtime once, seeds and (when
    /// configured) discovers the extension registry, and wires the agency
    /// with the built-in launchers.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let host = HostRuntime::current();
        let mut registry = ExtensionRegistry::new(host.clone())?;
        if let Some(extension_dir) = &config.extension_dir {
            registry.discover(extension_dir)?;
        }

        let agent_executable = config
            .agent_executable
            .clone()
            .unwrap_or_else(resolve_agent_executable);
        let mut agency_config = AgencyConfig::default();
        if let Some(socket_dir) = config.socket_dir {
            agency_config.socket_dir = socket_dir;
        }
        if let Some(secs) = config.handshake_timeout_secs {
            agency_config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = config.stop_timeout_secs {
            agency_config.stop_timeout = Duration::from_secs(secs);
        }
        let agency = Arc::new(TestAgency::new(
            default_launchers(agent_executable),
            agency_config,
        ));

        Ok(Self {
            host,
            registry,
            agency,
        })
    }

    pub fn host(&self) -> &HostRuntime {
        &self.host
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.registry
    }

    pub fn agency(&self) -> &Arc<TestAgency> {
        &self.agency
    }

    /// A runner for the given package, sharing this engine's agency.
    pub fn runner(&self, package: TestPackage) -> TestRunner {
        TestRunner::new(self.agency.clone(), package)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    Agency(#[from] AgencyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no agent is tracked for package `{package_id}`")]
    MissingAgent { package_id: String },
    #[error("failed to read engine config `{path}`: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse engine config `{path}`: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_round_trips_through_toml() {
        let text = "extension_dir = \"/opt/gantry/addins\"\nhandshake_timeout_secs = 5\n";
        let config: EngineConfig = toml::from_str(text).expect("config should parse");
        assert_eq!(
            config.extension_dir,
            Some(PathBuf::from("/opt/gantry/addins"))
        );
        assert_eq!(config.handshake_timeout_secs, Some(5));
        assert_eq!(config.socket_dir, None);
    }

    #[test]
    fn empty_engine_config_is_valid() {
        let config: EngineConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn engine_builds_with_defaults() {
        let engine = TestEngine::new(EngineConfig::default()).expect("engine should build");
        assert_eq!(engine.host().runtime.to_string(), "netcore-3.1");
        assert!(
            engine
                .registry()
                .get_extension_point("/Engine/TypeExtensions/AgentLauncher")
                .is_some()
        );
    }
}
