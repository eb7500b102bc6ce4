//! In-memory channels.
//!
//! A [`MemoryConnector`] hands out one end of a [`memory_pair`] per open call
//! and gives the other end to an endpoint implementation, which typically
//! serves it from a spawned task.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use notebook_mcp_core::{Error, Result};

use crate::channel::{Channel, Connector, DocumentTarget, KernelTarget};

/// One end of an in-memory JSON channel.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Value>>,
    rx: mpsc::UnboundedReceiver<Value>,
}

/// Cloneable sending half of a [`MemoryChannel`].
#[derive(Debug, Clone)]
pub struct MemorySender(mpsc::UnboundedSender<Value>);

impl MemorySender {
    /// Send without awaiting. Fails with `NotConnected` once the receiver is gone.
    pub fn send(&self, message: Value) -> Result<()> {
        self.0.send(message).map_err(|_| Error::NotConnected)
    }

    /// Whether the receiving end has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Receiving half of a split [`MemoryChannel`].
#[derive(Debug)]
pub struct MemoryReceiver(mpsc::UnboundedReceiver<Value>);

impl MemoryReceiver {
    /// Receive the next message; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.0.recv().await
    }
}

/// Create two connected channel ends.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl MemoryChannel {
    /// Send without awaiting. Fails with `NotConnected` once either end closed.
    pub fn send_value(&self, message: Value) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::NotConnected)?;
        tx.send(message).map_err(|_| Error::NotConnected)
    }

    /// A sender that delivers to this end's peer, usable from other tasks.
    pub fn sender(&self) -> Option<MemorySender> {
        self.tx.clone().map(MemorySender)
    }

    /// Split into independently owned halves.
    ///
    /// The peer sees end-of-stream as soon as every clone of the sender is dropped.
    pub fn split(self) -> (Option<MemorySender>, MemoryReceiver) {
        (self.tx.map(MemorySender), MemoryReceiver(self.rx))
    }

    /// Receive the next message; `None` once the peer is gone.
    pub async fn recv_value(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Whether the peer end has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Drop the sending half and stop receiving.
    pub fn shutdown(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&mut self, message: Value) -> Result<()> {
        self.send_value(message)
    }

    async fn recv(&mut self) -> Option<Result<Value>> {
        self.recv_value().await.map(Ok)
    }

    async fn close(&mut self) {
        self.shutdown();
    }
}

/// Serves document channels for a [`MemoryConnector`].
pub trait DocumentEndpoint: Send + Sync {
    /// Validate `target` and return the client end of a new channel.
    fn accept(&self, target: &DocumentTarget) -> Result<MemoryChannel>;
}

/// Serves kernel channels for a [`MemoryConnector`].
pub trait KernelEndpoint: Send + Sync {
    /// Resolve the kernel id for `target`.
    fn resolve(&self, target: &KernelTarget) -> Result<String>;

    /// Validate `target` and return the client end of a new kernel channel.
    fn accept(&self, target: &KernelTarget, kernel_id: &str) -> Result<MemoryChannel>;

    /// Stop a running kernel.
    fn shutdown(&self, target: &KernelTarget, kernel_id: &str) -> Result<()>;
}

/// Connector whose channels are served in-process.
#[derive(Clone)]
pub struct MemoryConnector {
    document: Arc<dyn DocumentEndpoint>,
    kernel: Arc<dyn KernelEndpoint>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

impl MemoryConnector {
    /// Create a connector over the given endpoints.
    pub fn new(document: Arc<dyn DocumentEndpoint>, kernel: Arc<dyn KernelEndpoint>) -> Self {
        Self { document, kernel }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open_document(&self, target: &DocumentTarget) -> Result<Box<dyn Channel>> {
        debug!("Opening in-memory document channel: path={}", target.path);
        Ok(Box::new(self.document.accept(target)?))
    }

    async fn resolve_kernel(&self, target: &KernelTarget) -> Result<String> {
        self.kernel.resolve(target)
    }

    async fn open_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<Box<dyn Channel>> {
        debug!("Opening in-memory kernel channel: id={}", kernel_id);
        Ok(Box::new(self.kernel.accept(target, kernel_id)?))
    }

    async fn shutdown_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<()> {
        debug!("Stopping in-memory kernel: id={}", kernel_id);
        self.kernel.shutdown(target, kernel_id)
    }
}
