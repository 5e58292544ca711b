use std::path::PathBuf;

use types::{AgentInfo, RuntimeFamily, RuntimeId, TestPackage, settings};
use uuid::Uuid;

/// Environment override for the worker executable.
pub const AGENT_EXECUTABLE_ENV_KEY: &str = "GANTRY_AGENT_EXE";
/// Worker binary name used when no override or bundled copy is found.
pub const DEFAULT_AGENT_EXECUTABLE: &str = "gantry-agent";

/// An unstarted worker process: the program and its full argument list.
/// The agency decides when (and whether) to start it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentProcessSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// A plugin that advertises which runtimes it can host and constructs the
/// worker process for a package.
pub trait AgentLauncher: Send + Sync {
    fn agent_info(&self) -> AgentInfo;
    fn can_create_process(&self, package: &TestPackage) -> bool;
    fn create_process(
        &self,
        agent_id: Uuid,
        agency_url: &str,
        package: &TestPackage,
    ) -> AgentProcessSpec;
}

/// The built-in launchers in declaration order. Selection is ordered
/// first-match over this list.
pub fn default_launchers(agent_executable: PathBuf) -> Vec<Box<dyn AgentLauncher>> {
    vec![
        Box::new(Net20AgentLauncher::new(agent_executable.clone())),
        Box::new(Net40AgentLauncher::new(agent_executable.clone())),
        Box::new(NetCore21AgentLauncher::new(agent_executable.clone())),
        Box::new(NetCore31AgentLauncher::new(agent_executable.clone())),
        Box::new(Net50AgentLauncher::new(agent_executable)),
    ]
}

/// Resolves the worker executable: explicit environment override, then a
/// copy bundled next to the current executable, then the bare name for
/// PATH lookup.
pub fn resolve_agent_executable() -> PathBuf {
    if let Ok(explicit) = std::env::var(AGENT_EXECUTABLE_ENV_KEY) {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return PathBuf::from(explicit);
        }
    }

    if let Some(bundled) = bundled_agent_executable() {
        return bundled;
    }

    PathBuf::from(DEFAULT_AGENT_EXECUTABLE)
}

fn bundled_agent_executable() -> Option<PathBuf> {
    let current_executable = std::env::current_exe().ok()?;
    let bundled = current_executable.parent()?.join(DEFAULT_AGENT_EXECUTABLE);
    bundled.is_file().then_some(bundled)
}

/// The package's declared target runtime, if present and parseable.
fn target_runtime(package: &TestPackage) -> Option<RuntimeId> {
    let tag = package.setting_str(settings::TARGET_RUNTIME_FRAMEWORK)?;
    RuntimeId::parse(tag).ok()
}

/// Worker command line per the agency contract:
/// `<agent-id> <agency-url> --pid=<controller-pid> [--trace=<level>]
/// [--debug-agent] [--work=<dir>]`.
fn worker_args(agent_id: Uuid, agency_url: &str, package: &TestPackage) -> Vec<String> {
    let mut args = vec![
        agent_id.to_string(),
        agency_url.to_owned(),
        format!("--pid={}", std::process::id()),
    ];
    if let Some(level) = package.setting_str(settings::INTERNAL_TRACE_LEVEL) {
        args.push(format!("--trace={level}"));
    }
    if package.setting_bool(settings::DEBUG_AGENT) {
        args.push("--debug-agent".to_owned());
    }
    if let Some(work_dir) = package.setting_str(settings::WORK_DIRECTORY) {
        args.push(format!("--work={work_dir}"));
    }
    args
}

macro_rules! process_launcher {
    ($name:ident, $accepts:expr) => {
        pub struct $name {
            agent_executable: PathBuf,
        }

        impl $name {
            pub fn new(agent_executable: PathBuf) -> Self {
                Self { agent_executable }
            }
        }

        impl AgentLauncher for $name {
            fn agent_info(&self) -> AgentInfo {
                AgentInfo::local_process(stringify!($name))
            }

            fn can_create_process(&self, package: &TestPackage) -> bool {
                target_runtime(package).is_some_and(|runtime| {
                    let accepts: fn(&RuntimeId) -> bool = $accepts;
                    accepts(&runtime)
                })
            }

            fn create_process(
                &self,
                agent_id: Uuid,
                agency_url: &str,
                package: &TestPackage,
            ) -> AgentProcessSpec {
                AgentProcessSpec::new(
                    self.agent_executable.clone(),
                    worker_args(agent_id, agency_url, package),
                )
            }
        }
    };
}

fn is_net_family(runtime: &RuntimeId) -> bool {
    matches!(runtime.family, RuntimeFamily::Net | RuntimeFamily::Mono)
}

fn version_at_most(runtime: &RuntimeId, major: u32, minor: u32) -> bool {
    let version = runtime.framework_version;
    (version.major, version.minor) <= (major, minor)
}

process_launcher!(Net20AgentLauncher, |runtime| {
    is_net_family(runtime) && runtime.framework_version.major < 4
});
process_launcher!(Net40AgentLauncher, |runtime| {
    is_net_family(runtime)
        && runtime.framework_version.major >= 2
        && runtime.framework_version.major <= 4
});
process_launcher!(NetCore21AgentLauncher, |runtime| {
    runtime.family == RuntimeFamily::NetCore && version_at_most(runtime, 2, 1)
});
process_launcher!(NetCore31AgentLauncher, |runtime| {
    runtime.family == RuntimeFamily::NetCore && version_at_most(runtime, 3, 1)
});
process_launcher!(Net50AgentLauncher, |runtime| {
    runtime.family == RuntimeFamily::NetCore && version_at_most(runtime, 5, 0)
});
