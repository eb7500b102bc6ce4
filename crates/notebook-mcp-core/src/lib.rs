//! # notebook-mcp-core
//!
//! Core types for the Notebook MCP Server.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other notebook-mcp crates. It provides:
//!
//! - Configuration (ServerConfig, SessionConfig)
//! - Notebook data model (Cell, CellId, Output)
//! - Connection state machine and handles
//! - Wire protocol messages for the document sync and kernel channels
//! - Error types
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other notebook-mcp crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod config;
pub mod error;
pub mod output;
pub mod protocol;
pub mod session;

// Re-export commonly used types
pub use cell::{Cell, CellId, CellType};
pub use config::{BridgeSettings, NotebookSettings, ServerConfig, ServerSettings, SessionConfig};
pub use error::{Error, Result};
pub use output::{strip_ansi, MimeBundle, Output, StreamName};
pub use session::{ConnectionHandle, ConnectionState, HandleId};
