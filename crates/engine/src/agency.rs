use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use types::{
    AgentCodec, AgentStatus, ErrorEnvelope, EventFrame, FrameKind, TestPackage, WireError,
    EVENT_AGENT_STARTED, settings,
};
use uuid::Uuid;

use crate::launcher::AgentLauncher;
use crate::proxy::TestAgent;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AgencyConfig {
    /// Directory the per-agent control sockets are bound in.
    pub socket_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir().join(format!("gantry-agency-{}", std::process::id())),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Exit observation published by an agent's monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

pub(crate) struct AgentRecord {
    pub(crate) status: AgentStatus,
    pub(crate) launcher_name: String,
    pub(crate) created_at: SystemTime,
    pub(crate) socket_path: PathBuf,
    pub(crate) kill: Option<oneshot::Sender<()>>,
    pub(crate) exit: watch::Receiver<Option<WorkerExit>>,
}

pub(crate) type SharedRecords = Arc<Mutex<HashMap<Uuid, AgentRecord>>>;

/// Spawns, tracks and reclaims worker processes, one record per agent.
pub struct TestAgency {
    launchers: Vec<Box<dyn AgentLauncher>>,
    config: AgencyConfig,
    records: SharedRecords,
}

impl TestAgency {
    pub fn new(launchers: Vec<Box<dyn AgentLauncher>>, config: AgencyConfig) -> Self {
        Self {
            launchers,
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// First launcher in declaration order whose rule accepts the package.
    fn select_launcher(&self, package: &TestPackage) -> Result<&dyn AgentLauncher, AgencyError> {
        self.launchers
            .iter()
            .find(|launcher| launcher.can_create_process(package))
            .map(Box::as_ref)
            .ok_or_else(|| AgencyError::NoSuitableAgent {
                runtime: package
                    .setting_str(settings::TARGET_RUNTIME_FRAMEWORK)
                    .unwrap_or("<unset>")
                    .to_owned(),
            })
    }

    /// Selects a launcher, spawns the worker, and waits for its handshake.
    /// On success the returned proxy is Ready; any failure kills the
    /// process if it started and surfaces the cause.
    pub async fn get_agent(&self, package: &TestPackage) -> Result<TestAgent, AgencyError> {
        let launcher = self.select_launcher(package)?;
        let launcher_name = launcher.agent_info().launcher_name;
        let agent_id = Uuid::new_v4();

        std::fs::create_dir_all(&self.config.socket_dir).map_err(|source| {
            AgencyError::AgentLaunchFailed {
                cause: format!("cannot create socket directory: {source}"),
            }
        })?;
        let socket_path = self.config.socket_dir.join(format!("agent-{agent_id}.sock"));
        let _ = std::fs::remove_file(&socket_path);
        let listener =
            UnixListener::bind(&socket_path).map_err(|source| AgencyError::AgentLaunchFailed {
                cause: format!("cannot bind agent socket: {source}"),
            })?;
        let agency_url = format!("unix://{}", socket_path.display());

        let spec = launcher.create_process(agent_id, &agency_url, package);
        debug!(
            agent_id = %agent_id,
            launcher = %launcher_name,
            program = %spec.program.display(),
            "starting worker process"
        );
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(source) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(AgencyError::AgentLaunchFailed {
                    cause: format!("cannot start `{}`: {source}", spec.program.display()),
                });
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut records = self.records.lock().await;
            records.insert(
                agent_id,
                AgentRecord {
                    status: AgentStatus::Launching,
                    launcher_name: launcher_name.clone(),
                    created_at: SystemTime::now(),
                    socket_path: socket_path.clone(),
                    kill: Some(kill_tx),
                    exit: exit_rx.clone(),
                },
            );
        }
        spawn_monitor(agent_id, child, kill_rx, exit_tx, self.records.clone());

        match self.await_handshake(agent_id, &listener).await {
            Ok(channel) => {
                self.set_status(agent_id, AgentStatus::Ready).await;
                info!(agent_id = %agent_id, launcher = %launcher_name, "agent ready");
                Ok(TestAgent::new(
                    agent_id,
                    launcher_name,
                    channel,
                    self.records.clone(),
                    exit_rx,
                ))
            }
            Err(cause) => {
                warn!(agent_id = %agent_id, cause = %cause, "agent launch failed");
                self.kill_agent(agent_id).await;
                // Dead implies the process is gone; wait for the monitor
                // to observe the exit before recording it.
                if let Some(mut exit) = self.exit_receiver(agent_id).await {
                    wait_for_exit(&mut exit).await;
                }
                self.set_status(agent_id, AgentStatus::Dead).await;
                let _ = std::fs::remove_file(&socket_path);
                Err(AgencyError::AgentLaunchFailed { cause })
            }
        }
    }

    async fn await_handshake(
        &self,
        agent_id: Uuid,
        listener: &UnixListener,
    ) -> Result<Framed<tokio::net::UnixStream, AgentCodec>, String> {
        let accepted = timeout(self.config.handshake_timeout, listener.accept())
            .await
            .map_err(|_| {
                format!(
                    "no connection within {}s",
                    self.config.handshake_timeout.as_secs()
                )
            })?
            .map_err(|source| format!("accept failed: {source}"))?;
        let mut channel = Framed::new(accepted.0, AgentCodec::default());

        let first_frame = timeout(self.config.handshake_timeout, channel.next())
            .await
            .map_err(|_| "no handshake frame before timeout".to_owned())?
            .ok_or_else(|| "channel closed before handshake".to_owned())?
            .map_err(|source| format!("handshake frame malformed: {source}"))?;
        if first_frame.kind != FrameKind::Event {
            return Err(format!("expected handshake event, got {:?}", first_frame.kind));
        }
        let event = EventFrame::decode(&first_frame.payload)
            .map_err(|source| format!("handshake event malformed: {source}"))?;
        if event.code != EVENT_AGENT_STARTED {
            return Err(format!("expected `{EVENT_AGENT_STARTED}`, got `{}`", event.code));
        }
        if event.body != agent_id.to_string() {
            return Err(format!(
                "handshake id mismatch: expected {agent_id}, got {}",
                event.body
            ));
        }
        Ok(channel)
    }

    /// Sends Stop, waits for a graceful exit within the stop timeout, and
    /// kills the process when it overstays.
    pub async fn release_agent(&self, mut agent: TestAgent) -> Result<(), AgencyError> {
        let agent_id = agent.id();
        self.set_status(agent_id, AgentStatus::Stopping).await;
        agent.send_stop().await;

        let mut exit = self.exit_receiver(agent_id).await;
        let graceful = match exit.as_mut() {
            Some(exit) => timeout(self.config.stop_timeout, wait_for_exit(exit))
                .await
                .is_ok(),
            None => false,
        };
        if !graceful {
            warn!(agent_id = %agent_id, "agent did not stop in time, killing");
            self.kill_agent(agent_id).await;
            if let Some(exit) = exit.as_mut() {
                wait_for_exit(exit).await;
            }
        }

        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&agent_id) {
            record.status = AgentStatus::Dead;
            let _ = std::fs::remove_file(&record.socket_path);
            info!(
                agent_id = %agent_id,
                launcher = %record.launcher_name,
                graceful,
                "agent reclaimed"
            );
        }
        Ok(())
    }

    /// Force-terminates the worker without a Stop exchange. This is how a
    /// forced stop is implemented: at the process level, never
    /// cooperatively.
    pub async fn terminate_agent(&self, agent: &TestAgent) {
        let agent_id = agent.id();
        self.set_status(agent_id, AgentStatus::Stopping).await;
        self.kill_agent(agent_id).await;
        if let Some(mut exit) = self.exit_receiver(agent_id).await {
            wait_for_exit(&mut exit).await;
        }
        self.set_status(agent_id, AgentStatus::Dead).await;
    }

    pub async fn agent_status(&self, agent_id: Uuid) -> Option<AgentStatus> {
        self.records
            .lock()
            .await
            .get(&agent_id)
            .map(|record| record.status)
    }

    pub async fn agent_created_at(&self, agent_id: Uuid) -> Option<SystemTime> {
        self.records
            .lock()
            .await
            .get(&agent_id)
            .map(|record| record.created_at)
    }

    async fn set_status(&self, agent_id: Uuid, status: AgentStatus) {
        set_record_status(&self.records, agent_id, status).await;
    }

    async fn kill_agent(&self, agent_id: Uuid) {
        let kill = {
            let mut records = self.records.lock().await;
            records.get_mut(&agent_id).and_then(|record| record.kill.take())
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
    }

    async fn exit_receiver(&self, agent_id: Uuid) -> Option<watch::Receiver<Option<WorkerExit>>> {
        self.records
            .lock()
            .await
            .get(&agent_id)
            .map(|record| record.exit.clone())
    }
}

pub(crate) async fn set_record_status(records: &SharedRecords, agent_id: Uuid, status: AgentStatus) {
    let mut records = records.lock().await;
    if let Some(record) = records.get_mut(&agent_id) {
        debug!(agent_id = %agent_id, from = %record.status, to = %status, "agent status");
        record.status = status;
    }
}

/// Waits until the watch channel publishes an exit observation.
pub(crate) async fn wait_for_exit(exit: &mut watch::Receiver<Option<WorkerExit>>) -> WorkerExit {
    loop {
        if let Some(observed) = *exit.borrow() {
            return observed;
        }
        if exit.changed().await.is_err() {
            // Monitor task is gone; the process can no longer be running.
            return WorkerExit { code: None };
        }
    }
}

/// Owns the child process for its whole life: publishes the exit status,
/// kills on request, and flags unexpected exits as crashes.
fn spawn_monitor(
    agent_id: Uuid,
    mut child: tokio::process::Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    records: SharedRecords,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let exit = WorkerExit {
            code: status.ok().and_then(|status| status.code()),
        };

        let mut records = records.lock().await;
        if let Some(record) = records.get_mut(&agent_id) {
            if record.status != AgentStatus::Stopping && record.status != AgentStatus::Dead {
                warn!(
                    agent_id = %agent_id,
                    exit_code = ?exit.code,
                    status = %record.status,
                    "agent process exited unexpectedly"
                );
            }
            record.status = AgentStatus::Dead;
            let _ = std::fs::remove_file(&record.socket_path);
        }
        drop(records);
        let _ = exit_tx.send(Some(exit));
    });
}

#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("no launcher accepts a package targeting `{runtime}`")]
    NoSuitableAgent { runtime: String },
    #[error("agent launch failed: {cause}")]
    AgentLaunchFailed { cause: String },
    #[error("agent `{agent_id}` crashed (exit code {exit_code:?})")]
    AgentCrashed {
        agent_id: Uuid,
        exit_code: Option<i32>,
    },
    #[error("agent `{agent_id}` broke protocol: {detail}")]
    Protocol { agent_id: Uuid, detail: String },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("driver reported {0}")]
    Driver(ErrorEnvelope),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::default_launchers;
    use std::path::PathBuf;

    fn agency() -> TestAgency {
        TestAgency::new(
            default_launchers(PathBuf::from("gantry-agent")),
            AgencyConfig::default(),
        )
    }

    #[test]
    fn selection_follows_declaration_order() {
        let agency = agency();
        let mut package = TestPackage::new("/work/suite.gimg");
        package.add_setting(settings::TARGET_RUNTIME_FRAMEWORK, "net-2.0");
        let launcher = agency
            .select_launcher(&package)
            .expect("net-2.0 should match");
        assert_eq!(launcher.agent_info().launcher_name, "Net20AgentLauncher");
    }

    #[test]
    fn selection_without_a_match_is_no_suitable_agent() {
        let agency = agency();
        let mut package = TestPackage::new("/work/suite.gimg");
        package.add_setting(settings::TARGET_RUNTIME_FRAMEWORK, "netcore-9.0");
        let error = agency
            .select_launcher(&package)
            .err()
            .expect("netcore-9.0 has no launcher");
        assert!(matches!(
            error,
            AgencyError::NoSuitableAgent { runtime } if runtime == "netcore-9.0"
        ));
    }

    #[tokio::test]
    async fn launch_failure_surfaces_the_cause() {
        let mut config = AgencyConfig::default();
        config.handshake_timeout = Duration::from_millis(200);
        let agency = TestAgency::new(
            default_launchers(PathBuf::from("/nonexistent/gantry-agent")),
            config,
        );
        let mut package = TestPackage::new("/work/suite.gimg");
        package.add_setting(settings::TARGET_RUNTIME_FRAMEWORK, "netcore-3.1");

        let error = agency
            .get_agent(&package)
            .await
            .err()
            .expect("spawn of a missing binary must fail");
        assert!(matches!(error, AgencyError::AgentLaunchFailed { .. }));
    }
}
