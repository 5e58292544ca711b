use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame (kind byte plus payload). Result frames
/// carry whole result documents, so the ceiling is generous.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Command names of the driver contract, shared by the controller-side
/// proxy and the worker's handler table.
pub const CMD_LOAD: &str = "Load";
pub const CMD_COUNT_TEST_CASES: &str = "CountTestCases";
pub const CMD_EXPLORE: &str = "Explore";
pub const CMD_RUN: &str = "Run";
pub const CMD_STOP_RUN: &str = "StopRun";

/// Event code of the handshake frame a worker sends right after
/// connecting; the body is its agent id.
pub const EVENT_AGENT_STARTED: &str = "agent-started";
/// Event code for test progress reports streamed during a run; the body is
/// an XML fragment, opaque to the transport.
pub const EVENT_TEST_PROGRESS: &str = "test-progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command,
    CommandResult,
    Event,
    Stop,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(FrameKind::Command),
            1 => Ok(FrameKind::CommandResult),
            2 => Ok(FrameKind::Event),
            3 => Ok(FrameKind::Stop),
            _ => Err(WireError::UnknownFrameKind { kind: value }),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Command => 0,
            FrameKind::CommandResult => 1,
            FrameKind::Event => 2,
            FrameKind::Stop => 3,
        }
    }
}

/// One wire frame: `[u32 length be][u8 kind][payload]`, where the length
/// covers the kind byte and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn command(command: &CommandFrame) -> Self {
        Self {
            kind: FrameKind::Command,
            payload: command.encode(),
        }
    }

    pub fn result(outcome: &CommandOutcome) -> Self {
        Self {
            kind: FrameKind::CommandResult,
            payload: outcome.encode(),
        }
    }

    pub fn event(event: &EventFrame) -> Self {
        Self {
            kind: FrameKind::Event,
            payload: event.encode(),
        }
    }

    pub fn stop() -> Self {
        Self {
            kind: FrameKind::Stop,
            payload: Bytes::new(),
        }
    }
}

/// Codec for the controller↔worker channel.
#[derive(Debug, Clone)]
pub struct AgentCodec {
    max_frame_bytes: usize,
}

impl Default for AgentCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl Decoder for AgentCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0_u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;
        if frame_length == 0 {
            return Err(WireError::EmptyFrame);
        }
        if frame_length > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                frame_bytes: frame_length,
                max_bytes: self.max_frame_bytes,
            });
        }
        if src.len() < 4 + frame_length {
            src.reserve(4 + frame_length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(frame_length);
        let kind = FrameKind::from_u8(body[0])?;
        body.advance(1);
        Ok(Some(Frame {
            kind,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for AgentCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let frame_length = 1 + frame.payload.len();
        if frame_length > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                frame_bytes: frame_length,
                max_bytes: self.max_frame_bytes,
            });
        }
        dst.reserve(4 + frame_length);
        dst.put_u32(frame_length as u32);
        dst.put_u8(frame.kind.as_u8());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// A command sent from the controller to the worker: a name and positional
/// string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandFrame {
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().collect(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        put_str(&mut buffer, &self.name);
        buffer.put_u32(self.args.len() as u32);
        for arg in &self.args {
            put_str(&mut buffer, arg);
        }
        buffer.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let name = reader.read_str()?;
        let arg_count = reader.read_u32()? as usize;
        let mut args = Vec::with_capacity(arg_count.min(64));
        for _ in 0..arg_count {
            args.push(reader.read_str()?);
        }
        reader.finish()?;
        Ok(Self { name, args })
    }
}

/// The error half of a result frame: an error kind tag plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a command: a textual result payload or an error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok(String),
    Err(ErrorEnvelope),
}

impl CommandOutcome {
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        match self {
            CommandOutcome::Ok(payload) => {
                buffer.put_u8(1);
                put_str(&mut buffer, payload);
            }
            CommandOutcome::Err(envelope) => {
                buffer.put_u8(0);
                put_str(&mut buffer, &envelope.kind);
                put_str(&mut buffer, &envelope.message);
            }
        }
        buffer.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let ok = reader.read_u8()?;
        let outcome = match ok {
            1 => CommandOutcome::Ok(reader.read_str()?),
            0 => {
                let kind = reader.read_str()?;
                let message = reader.read_str()?;
                CommandOutcome::Err(ErrorEnvelope { kind, message })
            }
            other => return Err(WireError::InvalidOutcomeTag { tag: other }),
        };
        reader.finish()?;
        Ok(outcome)
    }
}

/// A fire-and-forget event from the worker: a code naming the event and a
/// body whose format the transport does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub code: String,
    pub body: String,
}

impl EventFrame {
    pub fn new(code: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }

    pub fn agent_started(agent_id: &str) -> Self {
        Self::new(EVENT_AGENT_STARTED, agent_id)
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        put_str(&mut buffer, &self.code);
        put_str(&mut buffer, &self.body);
        buffer.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let code = reader.read_str()?;
        let body = reader.read_str()?;
        reader.finish()?;
        Ok(Self { code, body })
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("channel i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {frame_bytes} bytes exceeds the {max_bytes}-byte limit")]
    FrameTooLarge {
        frame_bytes: usize,
        max_bytes: usize,
    },
    #[error("frame length prefix must cover at least the kind byte")]
    EmptyFrame,
    #[error("unknown frame kind {kind}")]
    UnknownFrameKind { kind: u8 },
    #[error("payload truncated: wanted {wanted} more bytes, {available} available")]
    Truncated { wanted: usize, available: usize },
    #[error("payload has {remaining} undecoded trailing bytes")]
    TrailingBytes { remaining: usize },
    #[error("payload string is not valid UTF-8")]
    InvalidUtf8,
    #[error("result payload tag {tag} is neither ok nor error")]
    InvalidOutcomeTag { tag: u8 },
}

fn put_str(buffer: &mut BytesMut, value: &str) {
    buffer.put_u32(value.len() as u32);
    buffer.extend_from_slice(value.as_bytes());
}

struct PayloadReader<'a> {
    rest: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let (&value, rest) = self.rest.split_first().ok_or(WireError::Truncated {
            wanted: 1,
            available: 0,
        })?;
        self.rest = rest;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        let mut buffer = [0_u8; 4];
        buffer.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buffer))
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        if self.rest.len() < count {
            return Err(WireError::Truncated {
                wanted: count,
                available: self.rest.len(),
            });
        }
        let (taken, rest) = self.rest.split_at(count);
        self.rest = rest;
        Ok(taken)
    }

    fn read_str(&mut self) -> Result<String, WireError> {
        let length = self.read_u32()? as usize;
        let bytes = self.read_bytes(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes {
                remaining: self.rest.len(),
            })
        }
    }
}
