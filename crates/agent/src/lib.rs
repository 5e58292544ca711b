//! The worker process: loads one test binary through a framework driver
//! and serves the controller's commands over the framed channel.

mod controller;
mod driver;
mod filter;
mod manifest;
mod session;

use std::path::PathBuf;

use tokio::net::UnixStream;
use tracing::info;

pub use controller::{
    CONTROLLER_TYPE_NAME, ControllerError, FrameworkController, METHOD_COUNT_TESTS,
    METHOD_EXPLORE_TESTS, METHOD_LOAD_TESTS, METHOD_RUN_TESTS, METHOD_STOP_RUN, skipped_suite_xml,
};
pub use driver::{
    Driver, DriverError, DriverService, DriverState, InProcessDriver, InvalidBinaryDriver,
    SkippedAssemblyDriver,
};
pub use filter::{FilterError, TestFilter, xml_escape, xml_unescape};
pub use manifest::{CaseOutcome, TestCase, TestManifest, TestSuite};
pub use session::{AgentError, AgentSession, SessionEnd};

/// Worker exit codes: zero for a clean stop, the failed-test count after
/// a run, negative for internal failures.
pub const EXIT_OK: i32 = 0;
pub const EXIT_INTERNAL_ERROR: i32 = -1;
pub const EXIT_TRANSPORT_FAILURE: i32 = -2;

/// Everything the worker needs from its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub agent_id: String,
    pub agency_url: String,
    pub controller_pid: Option<u32>,
    pub work_dir: Option<PathBuf>,
}

/// Connects back to the agency and serves the session to completion.
/// Returns the process exit code.
pub async fn run_agent(options: AgentOptions) -> Result<i32, AgentError> {
    let socket_path = parse_agency_url(&options.agency_url)?;

    if let Some(work_dir) = &options.work_dir {
        if let Err(source) = std::fs::create_dir_all(work_dir)
            .and_then(|_| std::env::set_current_dir(work_dir))
        {
            tracing::warn!(
                work_dir = %work_dir.display(),
                error = %source,
                "cannot enter work directory"
            );
        }
    }

    let stream =
        UnixStream::connect(&socket_path)
            .await
            .map_err(|source| AgentError::Connect {
                path: socket_path.clone(),
                source,
            })?;
    info!(
        agent_id = %options.agent_id,
        controller_pid = ?options.controller_pid,
        socket = %socket_path.display(),
        "connected to agency"
    );

    let mut session = AgentSession::new(options.agent_id);
    let end = session.serve_stream(stream).await?;
    info!(end = ?end, failed = session.last_failed_count(), "agent session over");
    Ok(session.last_failed_count() as i32)
}

fn parse_agency_url(url: &str) -> Result<PathBuf, AgentError> {
    url.strip_prefix("unix://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| AgentError::InvalidUrl {
            url: url.to_owned(),
        })
}
