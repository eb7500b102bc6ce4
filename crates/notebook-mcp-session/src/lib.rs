//! # notebook-mcp-session
//!
//! Notebook and kernel sessions for the Notebook MCP Server.
//!
//! This crate provides:
//! - The document client and its local notebook mirror
//! - The kernel client and streamed execution handles
//! - Per-call execution state and aggregated results
//! - The execution bridge that ties one document to one kernel
//! - In-process fakes of the document store and kernel
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on notebook-mcp-core
//! and notebook-mcp-transport to drive the two remote sessions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod document;
pub mod execution;
pub mod kernel;
pub mod mirror;
pub mod testing;

// Re-export commonly used types
pub use bridge::ExecutionBridge;
pub use document::DocumentClient;
pub use execution::{CellSummary, ErrorInfo, ExecutionResult, ExecutionSession, NotebookContent};
pub use kernel::{ExecutionEvent, ExecutionHandle, KernelClient};
pub use mirror::{MirrorEffect, NotebookMirror};
pub use testing::{FakeDocumentStore, FakeKernel};
