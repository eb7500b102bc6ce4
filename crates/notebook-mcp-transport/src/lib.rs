//! # notebook-mcp-transport
//!
//! Message channels to the notebook server for the Notebook MCP Server.
//!
//! This crate provides:
//! - The [`Channel`] and [`Connector`] seams the clients are written against
//! - WebSocket channels (tokio-tungstenite) with HTTP status → error mapping
//! - Jupyter REST resolution of collaboration rooms and kernels
//! - Y-sync notebook replicas (yrs) behind the JSON document contract
//! - In-memory channels for embedding and tests
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on notebook-mcp-core
//! and knows nothing about executions; only the Y-sync adapter reads cells.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod jupyter;
pub mod memory;
pub mod websocket;
pub mod ydoc;

// Re-export commonly used types
pub use channel::{Channel, Connector, DocumentTarget, FrameChannel, KernelTarget};
pub use jupyter::JupyterConnector;
pub use memory::{
    memory_pair, DocumentEndpoint, KernelEndpoint, MemoryChannel, MemoryConnector, MemoryReceiver,
    MemorySender,
};
pub use websocket::WsChannel;
pub use ydoc::YNotebookChannel;
