//! Channel and connector traits.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use notebook_mcp_core::{Result, SessionConfig};

/// A bidirectional stream of JSON messages.
///
/// `recv` must be cancel safe: callers race it against deadlines and poll it
/// opportunistically to drain pending events.
#[async_trait]
pub trait Channel: Send {
    /// Send one message.
    async fn send(&mut self, message: Value) -> Result<()>;

    /// Receive the next message; `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Option<Result<Value>>;

    /// Close the channel. Later sends fail with `NotConnected`.
    async fn close(&mut self);
}

/// A bidirectional stream of binary frames, for protocols that are not JSON.
#[async_trait]
pub trait FrameChannel: Send {
    /// Send one frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Receive the next frame; `None` once the peer has closed the stream.
    ///
    /// Must be cancel safe.
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>>>;

    /// Close the stream.
    async fn shutdown(&mut self);
}

/// Opens channels to the document store and the kernel.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the sync channel for a notebook document.
    async fn open_document(&self, target: &DocumentTarget) -> Result<Box<dyn Channel>>;

    /// Resolve the kernel to attach to, starting one if none is configured.
    async fn resolve_kernel(&self, target: &KernelTarget) -> Result<String>;

    /// Open the message channel of a resolved kernel.
    async fn open_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<Box<dyn Channel>>;

    /// Stop a kernel started by [`resolve_kernel`](Connector::resolve_kernel).
    async fn shutdown_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<()>;
}

/// Where the document channel connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTarget {
    /// Server base URL
    pub server_url: Url,
    /// Notebook path relative to the server root
    pub path: String,
    /// Auth token (empty = none)
    pub token: String,
}

impl From<&SessionConfig> for DocumentTarget {
    fn from(config: &SessionConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            path: config.notebook_path.clone(),
            token: config.token.clone(),
        }
    }
}

/// Where the kernel channel connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTarget {
    /// Server base URL
    pub server_url: Url,
    /// Existing kernel id, if configured
    pub kernel_id: Option<String>,
    /// Kernelspec used when starting a kernel
    pub kernel_name: String,
    /// Auth token (empty = none)
    pub token: String,
}

impl From<&SessionConfig> for KernelTarget {
    fn from(config: &SessionConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            kernel_id: config.kernel_id.clone(),
            kernel_name: config.kernel_name.clone(),
            token: config.token.clone(),
        }
    }
}
