use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use types::{
    AgentCodec, AgentStatus, CMD_COUNT_TEST_CASES, CMD_EXPLORE, CMD_LOAD, CMD_RUN, CMD_STOP_RUN,
    CommandFrame, CommandOutcome, EventFrame, Frame, FrameKind, EVENT_TEST_PROGRESS,
};
use uuid::Uuid;

use crate::agency::{
    AgencyError, SharedRecords, WorkerExit, set_record_status, wait_for_exit,
};

/// Receives progress reports while a run is in flight, in worker-emission
/// order.
pub trait TestEventListener: Send {
    fn on_test_event(&mut self, report: &str);
}

/// Listener that discards every event.
#[derive(Debug, Default)]
pub struct NullListener;

impl TestEventListener for NullListener {
    fn on_test_event(&mut self, _report: &str) {}
}

/// Collects events in memory; mainly for tests and summaries.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub reports: Vec<String>,
}

impl TestEventListener for RecordingListener {
    fn on_test_event(&mut self, report: &str) {
        self.reports.push(report.to_owned());
    }
}

/// Controller-side proxy to one worker. Commands are serialized by
/// construction: every operation takes `&mut self`, so at most one is
/// outstanding.
pub struct TestAgent {
    id: Uuid,
    launcher_name: String,
    channel: Framed<UnixStream, AgentCodec>,
    records: SharedRecords,
    exit: tokio::sync::watch::Receiver<Option<WorkerExit>>,
}

impl TestAgent {
    pub(crate) fn new(
        id: Uuid,
        launcher_name: String,
        channel: Framed<UnixStream, AgentCodec>,
        records: SharedRecords,
        exit: tokio::sync::watch::Receiver<Option<WorkerExit>>,
    ) -> Self {
        Self {
            id,
            launcher_name,
            channel,
            records,
            exit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn launcher_name(&self) -> &str {
        &self.launcher_name
    }

    /// Loads the test binary; returns the XML test tree.
    pub async fn load(&mut self, binary: &Path, settings_json: &str) -> Result<String, AgencyError> {
        let command = CommandFrame::new(
            CMD_LOAD,
            [binary.display().to_string(), settings_json.to_owned()],
        );
        self.conversation(command, &mut NullListener).await
    }

    pub async fn count_test_cases(&mut self, filter: &str) -> Result<u32, AgencyError> {
        let command = CommandFrame::new(CMD_COUNT_TEST_CASES, [filter.to_owned()]);
        let count = self.conversation(command, &mut NullListener).await?;
        count.trim().parse().map_err(|_| AgencyError::Protocol {
            agent_id: self.id,
            detail: format!("CountTestCases returned non-numeric payload `{count}`"),
        })
    }

    pub async fn explore(&mut self, filter: &str) -> Result<String, AgencyError> {
        let command = CommandFrame::new(CMD_EXPLORE, [filter.to_owned()]);
        self.conversation(command, &mut NullListener).await
    }

    /// Runs the loaded binary, forwarding progress events to `listener`
    /// until the result frame closes the conversation.
    pub async fn run(
        &mut self,
        filter: &str,
        listener: &mut dyn TestEventListener,
    ) -> Result<String, AgencyError> {
        let command = CommandFrame::new(CMD_RUN, [filter.to_owned()]);
        self.conversation(command, listener).await
    }

    pub async fn stop_run(&mut self, force: bool) -> Result<(), AgencyError> {
        let command = CommandFrame::new(CMD_STOP_RUN, [force.to_string()]);
        self.conversation(command, &mut NullListener).await?;
        Ok(())
    }

    /// Best-effort Stop frame; used by the agency during release.
    pub(crate) async fn send_stop(&mut self) {
        if let Err(error) = self.channel.send(Frame::stop()).await {
            debug!(agent_id = %self.id, error = %error, "stop frame not delivered");
        }
    }

    /// One full command conversation: send, interleave events, finish on
    /// the result frame. A process exit observed mid-conversation resolves
    /// the command with `AgentCrashed`.
    async fn conversation(
        &mut self,
        command: CommandFrame,
        listener: &mut dyn TestEventListener,
    ) -> Result<String, AgencyError> {
        set_record_status(&self.records, self.id, AgentStatus::Running).await;
        let result = self.conversation_inner(command, listener).await;
        match &result {
            Ok(_) | Err(AgencyError::Driver(_)) => {
                set_record_status(&self.records, self.id, AgentStatus::Ready).await;
            }
            Err(_) => {
                set_record_status(&self.records, self.id, AgentStatus::Dead).await;
            }
        }
        result
    }

    async fn conversation_inner(
        &mut self,
        command: CommandFrame,
        listener: &mut dyn TestEventListener,
    ) -> Result<String, AgencyError> {
        let command_name = command.name.clone();
        debug!(agent_id = %self.id, command = %command_name, "sending command");
        self.channel.send(Frame::command(&command)).await?;

        loop {
            tokio::select! {
                // Drain buffered frames before acting on an observed exit:
                // the result frame may already be in flight when the worker
                // terminates.
                biased;
                frame = self.channel.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(error)) => return Err(error.into()),
                        None => {
                            // Channel closed without a result: the worker is
                            // gone. Report it as a crash with whatever exit
                            // status the monitor observed.
                            let exit = wait_for_exit(&mut self.exit).await;
                            return Err(AgencyError::AgentCrashed {
                                agent_id: self.id,
                                exit_code: exit.code,
                            });
                        }
                    };
                    match frame.kind {
                        FrameKind::Event => {
                            let event = EventFrame::decode(&frame.payload)?;
                            if event.code == EVENT_TEST_PROGRESS {
                                listener.on_test_event(&event.body);
                            } else {
                                warn!(
                                    agent_id = %self.id,
                                    code = %event.code,
                                    "ignoring unexpected event"
                                );
                            }
                        }
                        FrameKind::CommandResult => {
                            let outcome = CommandOutcome::decode(&frame.payload)?;
                            debug!(agent_id = %self.id, command = %command_name, "command completed");
                            return match outcome {
                                CommandOutcome::Ok(payload) => Ok(payload),
                                CommandOutcome::Err(envelope) => {
                                    Err(AgencyError::Driver(envelope))
                                }
                            };
                        }
                        FrameKind::Command | FrameKind::Stop => {
                            return Err(AgencyError::Protocol {
                                agent_id: self.id,
                                detail: format!("worker sent a {:?} frame", frame.kind),
                            });
                        }
                    }
                }
                exit = wait_for_exit(&mut self.exit) => {
                    return Err(AgencyError::AgentCrashed {
                        agent_id: self.id,
                        exit_code: exit.code,
                    });
                }
            }
        }
    }
}
