//! Wire protocol messages.
//!
//! - [`document`]: JSON change messages exchanged with the document channel.
//!   Transports that speak another sync protocol translate to these.
//! - [`kernel`]: Jupyter messaging protocol (v5) over the kernel channel.

pub mod document;
pub mod kernel;

pub use document::{
    CellUpdate, DocumentEvent, DocumentRequest, NackReason, DOCUMENT_PROTOCOL_VERSION,
};
pub use kernel::{
    ExecutionState, IopubEvent, KernelChannel, KernelMessage, MessageHeader, PROTOCOL_MAJOR,
    PROTOCOL_VERSION,
};
