mod agent;
mod package;
mod runtime;
mod tracing;
mod wire;

pub use agent::{AgentInfo, AgentKind, AgentStatus};
pub use package::{SettingValue, TestPackage, settings};
pub use runtime::{
    CLR_V2, CLR_V4, FRAMEWORK_ID_NET, FRAMEWORK_ID_NETCORE, FRAMEWORK_ID_NETSTANDARD,
    FrameworkName, HostRuntime, RuntimeFamily, RuntimeId, RuntimeIdError, RuntimeVersion,
};
pub use tracing::{init_tracing, init_tracing_with};
pub use wire::{
    AgentCodec, CMD_COUNT_TEST_CASES, CMD_EXPLORE, CMD_LOAD, CMD_RUN, CMD_STOP_RUN, CommandFrame,
    CommandOutcome, ErrorEnvelope, EVENT_AGENT_STARTED, EVENT_TEST_PROGRESS, EventFrame, Frame,
    FrameKind, MAX_FRAME_BYTES, WireError,
};
