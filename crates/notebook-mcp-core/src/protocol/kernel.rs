//! Jupyter messaging protocol (v5) as carried over the kernel WebSocket.
//!
//! Every frame is one JSON message with a `channel` field naming the logical
//! ZMQ channel (`shell`, `iopub`, `control`, `stdin`) it belongs to.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{Error, Output, Result};

/// Messaging protocol version sent in every header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Major protocol version this crate understands.
pub const PROTOCOL_MAJOR: u32 = 5;

const USERNAME: &str = "notebook-mcp";

/// Logical channel of a kernel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelChannel {
    /// Requests and replies
    Shell,
    /// Broadcast side effects (outputs, status)
    IoPub,
    /// Out-of-band control (interrupt, shutdown)
    Control,
    /// Input requests from the kernel
    Stdin,
}

impl KernelChannel {
    /// Wire name of the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelChannel::Shell => "shell",
            KernelChannel::IoPub => "iopub",
            KernelChannel::Control => "control",
            KernelChannel::Stdin => "stdin",
        }
    }

    /// Parse a wire channel name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(KernelChannel::Shell),
            "iopub" => Some(KernelChannel::IoPub),
            "control" => Some(KernelChannel::Control),
            "stdin" => Some(KernelChannel::Stdin),
            _ => None,
        }
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message id
    pub msg_id: String,
    /// Client session id
    pub session: String,
    /// Sender
    #[serde(default)]
    pub username: String,
    /// ISO-8601 timestamp
    #[serde(default)]
    pub date: String,
    /// Message type (`execute_request`, `stream`, ...)
    pub msg_type: String,
    /// Protocol version
    #[serde(default)]
    pub version: String,
}

impl MessageHeader {
    /// Fresh header for an outgoing message.
    pub fn new(session: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: USERNAME.to_string(),
            date: Utc::now().to_rfc3339(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One message on the kernel channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Header
    pub header: MessageHeader,
    /// Header of the request this message answers (`{}` when none)
    #[serde(default = "empty_object")]
    pub parent_header: Value,
    /// Metadata
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Type-specific content
    #[serde(default = "empty_object")]
    pub content: Value,
    /// Logical channel name
    #[serde(default)]
    pub channel: String,
    /// Binary buffers (unused)
    #[serde(default)]
    pub buffers: Vec<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl KernelMessage {
    /// Build a new message with no parent.
    pub fn new(channel: KernelChannel, session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            header: MessageHeader::new(session, msg_type),
            parent_header: empty_object(),
            metadata: empty_object(),
            content,
            channel: channel.as_str().to_string(),
            buffers: Vec::new(),
        }
    }

    /// Build a message answering `parent`.
    pub fn reply_to(parent: &KernelMessage, channel: KernelChannel, msg_type: &str, content: Value) -> Self {
        let mut message = Self::new(channel, &parent.header.session, msg_type, content);
        message.parent_header = serde_json::to_value(&parent.header).unwrap_or_else(|_| empty_object());
        message
    }

    /// `execute_request` for `code`.
    pub fn execute_request(session: &str, code: &str) -> Self {
        Self::new(
            KernelChannel::Shell,
            session,
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    /// `kernel_info_request`, used as the connect handshake.
    pub fn kernel_info_request(session: &str) -> Self {
        Self::new(KernelChannel::Shell, session, "kernel_info_request", json!({}))
    }

    /// `interrupt_request` on the control channel.
    pub fn interrupt_request(session: &str) -> Self {
        Self::new(KernelChannel::Control, session, "interrupt_request", json!({}))
    }

    /// `shutdown_request` on the control channel.
    pub fn shutdown_request(session: &str, restart: bool) -> Self {
        Self::new(
            KernelChannel::Control,
            session,
            "shutdown_request",
            json!({ "restart": restart }),
        )
    }

    /// Message type.
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Message id.
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// Parsed channel, if known.
    pub fn kernel_channel(&self) -> Option<KernelChannel> {
        KernelChannel::parse(&self.channel)
    }

    /// `msg_id` of the request this message answers.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the wire.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid kernel message: {e}")))
    }

    /// Major protocol version advertised by a `kernel_info_reply`.
    pub fn protocol_major(&self) -> Option<u32> {
        self.content
            .get("protocol_version")
            .and_then(Value::as_str)
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse().ok())
    }

    /// Interpret an iopub message.
    pub fn iopub_event(&self) -> Result<IopubEvent> {
        let event = match self.msg_type() {
            "status" => {
                let state = self
                    .content
                    .get("execution_state")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                IopubEvent::Status(ExecutionState::parse(state))
            }
            "execute_input" => IopubEvent::ExecuteInput {
                execution_count: self.execution_count(),
            },
            "clear_output" => IopubEvent::ClearOutput {
                wait: self
                    .content
                    .get("wait")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "stream" | "display_data" | "update_display_data" | "execute_result" | "error" => {
                let output_type = match self.msg_type() {
                    "update_display_data" => "display_data",
                    other => other,
                };
                let mut content = self.content.clone();
                let object = content.as_object_mut().ok_or_else(|| {
                    Error::Protocol(format!("{} content is not an object", self.msg_type()))
                })?;
                object.insert("output_type".into(), Value::String(output_type.into()));
                let output: Output = serde_json::from_value(content).map_err(|e| {
                    Error::Protocol(format!("invalid {} content: {e}", self.msg_type()))
                })?;
                match (self.msg_type(), self.display_id()) {
                    ("update_display_data", Some(display_id)) => IopubEvent::UpdateDisplay {
                        display_id: display_id.to_string(),
                        output,
                    },
                    ("update_display_data", None) => {
                        return Err(Error::Protocol(
                            "update_display_data carries no display_id".into(),
                        ))
                    }
                    ("display_data", Some(display_id)) => IopubEvent::Display {
                        display_id: display_id.to_string(),
                        output,
                    },
                    _ => IopubEvent::Output(output),
                }
            }
            _ => IopubEvent::Other,
        };
        Ok(event)
    }

    /// `transient.display_id` of a display message.
    pub fn display_id(&self) -> Option<&str> {
        self.content
            .get("transient")
            .and_then(|transient| transient.get("display_id"))
            .and_then(Value::as_str)
    }

    /// `status` of a reply (`ok`, `error`, `aborted`).
    pub fn reply_status(&self) -> Option<&str> {
        self.content.get("status").and_then(Value::as_str)
    }

    /// `execution_count` field of the content, if present.
    pub fn execution_count(&self) -> Option<u32> {
        self.content
            .get("execution_count")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
    }
}

/// Kernel activity state carried by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Kernel is starting
    Starting,
    /// Kernel is processing a request
    Busy,
    /// Kernel finished processing a request
    Idle,
    /// Kernel is restarting
    Restarting,
    /// Kernel process died
    Dead,
    /// Anything else
    Unknown,
}

impl ExecutionState {
    /// Parse a wire state name.
    pub fn parse(state: &str) -> Self {
        match state {
            "starting" => ExecutionState::Starting,
            "busy" => ExecutionState::Busy,
            "idle" => ExecutionState::Idle,
            "restarting" => ExecutionState::Restarting,
            "dead" => ExecutionState::Dead,
            _ => ExecutionState::Unknown,
        }
    }
}

/// Meaningful content of an iopub message.
#[derive(Debug, Clone, PartialEq)]
pub enum IopubEvent {
    /// Kernel state change
    Status(ExecutionState),
    /// Kernel echoed the code with its execution counter
    ExecuteInput {
        /// Assigned counter
        execution_count: Option<u32>,
    },
    /// An output
    Output(Output),
    /// A display output that later updates may replace
    Display {
        /// `transient.display_id`
        display_id: String,
        /// The display output
        output: Output,
    },
    /// New content for every earlier display with this id
    UpdateDisplay {
        /// `transient.display_id`
        display_id: String,
        /// Replacement display output
        output: Output,
    },
    /// Clear the outputs produced so far
    ClearOutput {
        /// Defer clearing until the next output arrives
        wait: bool,
    },
    /// Irrelevant to execution (comm messages etc.)
    Other,
}
