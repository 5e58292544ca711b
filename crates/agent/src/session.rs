use std::collections::BTreeMap;
use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use types::{
    AgentCodec, CMD_COUNT_TEST_CASES, CMD_EXPLORE, CMD_LOAD, CMD_RUN, CMD_STOP_RUN, CommandFrame,
    CommandOutcome, ErrorEnvelope, EventFrame, Frame, FrameKind, SettingValue, WireError,
    EVENT_TEST_PROGRESS, settings,
};

use crate::driver::{Driver, DriverError, DriverService};

/// Why the frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The controller sent a Stop frame.
    Stopped,
    /// The channel closed without a Stop.
    Disconnected,
}

/// The worker side of one controller connection: sends the handshake,
/// then answers command frames until stopped. Hosts at most one driver.
pub struct AgentSession {
    agent_id: String,
    driver: Option<Box<dyn Driver>>,
    last_failed_count: u32,
}

impl AgentSession {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            driver: None,
            last_failed_count: 0,
        }
    }

    /// Failed-test count of the most recent run; the worker's exit code.
    pub fn last_failed_count(&self) -> u32 {
        self.last_failed_count
    }

    pub async fn serve_stream<Stream>(&mut self, stream: Stream) -> Result<SessionEnd, AgentError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = Framed::new(stream, AgentCodec::default());
        channel
            .send(Frame::event(&EventFrame::agent_started(&self.agent_id)))
            .await?;
        info!(agent_id = %self.agent_id, "agent session started");

        while let Some(frame_result) = channel.next().await {
            let frame = frame_result?;
            match frame.kind {
                FrameKind::Command => {
                    let command = match CommandFrame::decode(&frame.payload) {
                        Ok(command) => command,
                        Err(source) => {
                            let envelope =
                                ErrorEnvelope::new("Protocol", source.to_string());
                            channel
                                .send(Frame::result(&CommandOutcome::Err(envelope)))
                                .await?;
                            continue;
                        }
                    };
                    debug!(agent_id = %self.agent_id, command = %command.name, "command received");
                    let (events, outcome) = self.dispatch(&command);
                    for event in events {
                        channel
                            .send(Frame::event(&EventFrame::new(EVENT_TEST_PROGRESS, event)))
                            .await?;
                    }
                    channel.send(Frame::result(&outcome)).await?;
                }
                FrameKind::Stop => {
                    info!(agent_id = %self.agent_id, "stop frame received");
                    return Ok(SessionEnd::Stopped);
                }
                FrameKind::CommandResult | FrameKind::Event => {
                    warn!(
                        agent_id = %self.agent_id,
                        kind = ?frame.kind,
                        "ignoring frame the controller should not send"
                    );
                }
            }
        }
        Ok(SessionEnd::Disconnected)
    }

    /// The worker's handler table: command name → handler. Events emitted
    /// while a handler runs precede the result frame, in emission order.
    fn dispatch(&mut self, command: &CommandFrame) -> (Vec<String>, CommandOutcome) {
        let mut events = Vec::new();
        let outcome = match command.name.as_str() {
            CMD_LOAD => self.handle_load(&command.args),
            CMD_COUNT_TEST_CASES => self.handle_count(&command.args),
            CMD_EXPLORE => self.handle_explore(&command.args),
            CMD_RUN => self.handle_run(&command.args, &mut events),
            CMD_STOP_RUN => self.handle_stop_run(&command.args),
            other => Err(ErrorEnvelope::new(
                "Protocol",
                format!("unknown command `{other}`"),
            )),
        };
        let outcome = match outcome {
            Ok(payload) => CommandOutcome::Ok(payload),
            Err(envelope) => CommandOutcome::Err(envelope),
        };
        (events, outcome)
    }

    fn handle_load(&mut self, args: &[String]) -> Result<String, ErrorEnvelope> {
        let [binary_path, settings_json] = args else {
            return Err(arity_error(CMD_LOAD, 2, args.len()));
        };
        let package_settings: BTreeMap<String, SettingValue> =
            serde_json::from_str(settings_json).map_err(|source| {
                ErrorEnvelope::new("Protocol", format!("malformed settings payload: {source}"))
            })?;

        // At most one driver per worker.
        if self.driver.is_some() {
            return Err(ErrorEnvelope::new(
                "DriverError",
                "a test binary is already loaded in this worker",
            ));
        }

        let skip_non_test = package_settings
            .get(settings::SKIP_NON_TEST_ASSEMBLIES)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false);
        let mut driver = DriverService::get_driver(&PathBuf::from(binary_path), skip_non_test);
        let tree = driver.load(&package_settings).map_err(to_envelope)?;
        self.driver = Some(driver);
        Ok(tree)
    }

    fn handle_count(&mut self, args: &[String]) -> Result<String, ErrorEnvelope> {
        let [filter] = args else {
            return Err(arity_error(CMD_COUNT_TEST_CASES, 1, args.len()));
        };
        let driver = self.driver_mut()?;
        let count = driver.count_test_cases(filter).map_err(to_envelope)?;
        Ok(count.to_string())
    }

    fn handle_explore(&mut self, args: &[String]) -> Result<String, ErrorEnvelope> {
        let [filter] = args else {
            return Err(arity_error(CMD_EXPLORE, 1, args.len()));
        };
        let driver = self.driver_mut()?;
        driver.explore(filter).map_err(to_envelope)
    }

    fn handle_run(
        &mut self,
        args: &[String],
        events: &mut Vec<String>,
    ) -> Result<String, ErrorEnvelope> {
        let [filter] = args else {
            return Err(arity_error(CMD_RUN, 1, args.len()));
        };
        let driver = match self.driver.as_mut() {
            Some(driver) => driver,
            None => return Err(to_envelope(DriverError::NotLoaded)),
        };
        let mut emit = |report: String| events.push(report);
        let result = driver.run(&mut emit, filter).map_err(to_envelope)?;
        self.last_failed_count = failed_count(&result);
        Ok(result)
    }

    fn handle_stop_run(&mut self, args: &[String]) -> Result<String, ErrorEnvelope> {
        let [force_text] = args else {
            return Err(arity_error(CMD_STOP_RUN, 1, args.len()));
        };
        let force = force_text.parse().map_err(|_| {
            ErrorEnvelope::new(
                "Protocol",
                format!("StopRun expects a boolean, got `{force_text}`"),
            )
        })?;
        let driver = self.driver_mut()?;
        driver.stop_run(force).map_err(to_envelope)?;
        Ok(String::new())
    }

    fn driver_mut(&mut self) -> Result<&mut Box<dyn Driver>, ErrorEnvelope> {
        self.driver
            .as_mut()
            .ok_or_else(|| to_envelope(DriverError::NotLoaded))
    }
}

fn to_envelope(error: DriverError) -> ErrorEnvelope {
    ErrorEnvelope::new(error.kind(), error.to_string())
}

fn arity_error(command: &str, wanted: usize, got: usize) -> ErrorEnvelope {
    ErrorEnvelope::new(
        "Protocol",
        format!("`{command}` takes {wanted} argument(s), got {got}"),
    )
}

/// Reads the failed counter out of a result document; feeds the worker's
/// exit code.
fn failed_count(result_xml: &str) -> u32 {
    let marker = " failed=\"";
    let Some(start) = result_xml.find(marker) else {
        return 0;
    };
    let rest = &result_xml[start + marker.len()..];
    let Some(end) = rest.find('"') else {
        return 0;
    };
    rest[..end].parse().unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("invalid agency url `{url}`: expected unix://<socket-path>")]
    InvalidUrl { url: String },
    #[error("cannot connect to agency socket `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
