//! Document sync channel messages.
//!
//! The store is authoritative. Clients send requests carrying a `request_id`
//! and receive an `ack`/`nack` for each; edits made by other collaborators
//! arrive as unsolicited change events. A client's own writes are not echoed
//! back, so the client applies them to its mirror when the ack arrives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Cell, CellId, Error, Output, Result};

/// Version of the change-message protocol spoken by this crate.
pub const DOCUMENT_PROTOCOL_VERSION: u32 = 1;

/// Partial update of a cell's execution state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    /// New execution counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    /// Remove all outputs before applying the update
    #[serde(default)]
    pub clear_outputs: bool,
    /// Replace the outputs wholesale (display updates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Output>>,
}

impl CellUpdate {
    /// Update that only clears outputs.
    pub fn clear_outputs() -> Self {
        Self {
            clear_outputs: true,
            ..Self::default()
        }
    }

    /// Update that replaces every output.
    pub fn replace_outputs(outputs: Vec<Output>) -> Self {
        Self {
            outputs: Some(outputs),
            ..Self::default()
        }
    }

    /// Update that only sets the execution counter.
    pub fn execution_count(count: u32) -> Self {
        Self {
            execution_count: Some(count),
            ..Self::default()
        }
    }

    /// Apply this update to a cell.
    pub fn apply(&self, cell: &mut Cell) {
        if self.clear_outputs {
            cell.outputs.clear();
        }
        if let Some(outputs) = &self.outputs {
            cell.outputs = outputs.clone();
        }
        if let Some(count) = self.execution_count {
            cell.execution_count = Some(count);
        }
    }
}

/// Client → store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentRequest {
    /// Ask for a full snapshot (sent on every connect)
    SyncRequest {
        /// Protocol version spoken by the client
        protocol_version: u32,
    },
    /// Append a cell at the end of the document
    InsertCell {
        /// Correlation id
        request_id: String,
        /// Cell to insert
        cell: Cell,
    },
    /// Append an output to a cell
    AppendOutput {
        /// Correlation id
        request_id: String,
        /// Target cell
        cell_id: CellId,
        /// Output to append
        output: Output,
    },
    /// Update a cell's execution state
    UpdateCell {
        /// Correlation id
        request_id: String,
        /// Target cell
        cell_id: CellId,
        /// Fields to change
        update: CellUpdate,
    },
}

impl DocumentRequest {
    /// Correlation id, if the request expects an ack.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            DocumentRequest::SyncRequest { .. } => None,
            DocumentRequest::InsertCell { request_id, .. }
            | DocumentRequest::AppendOutput { request_id, .. }
            | DocumentRequest::UpdateCell { request_id, .. } => Some(request_id),
        }
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the wire.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid document request: {e}")))
    }
}

/// Why the store refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// Target cell does not exist (deleted upstream)
    CellNotFound,
    /// Request was malformed or not allowed
    Rejected,
}

/// Store → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    /// Full document state
    Snapshot {
        /// Protocol version spoken by the store
        protocol_version: u32,
        /// Store-side document version
        version: u64,
        /// Cells in document order
        cells: Vec<Cell>,
    },
    /// Request applied
    Ack {
        /// Correlation id
        request_id: String,
        /// Position of an inserted cell
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Request refused
    Nack {
        /// Correlation id
        request_id: String,
        /// Reason for refusal
        reason: NackReason,
    },
    /// Another collaborator inserted a cell
    CellInserted {
        /// Position of the new cell
        index: usize,
        /// The cell
        cell: Cell,
    },
    /// Another collaborator replaced a cell's content
    CellUpdated {
        /// New cell state
        cell: Cell,
    },
    /// Another collaborator deleted a cell
    CellDeleted {
        /// Deleted cell
        cell_id: CellId,
    },
    /// Another collaborator appended an output
    OutputAppended {
        /// Target cell
        cell_id: CellId,
        /// Appended output
        output: Output,
    },
    /// Another collaborator cleared a cell's outputs
    OutputsCleared {
        /// Target cell
        cell_id: CellId,
    },
    /// The document itself was deleted
    DocumentDeleted,
    /// Store-side failure
    Error {
        /// Machine readable code
        code: String,
        /// Human readable message
        message: String,
    },
}

impl DocumentEvent {
    /// Encode for the wire.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the wire.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid document event: {e}")))
    }

    /// Correlation id of an ack or nack.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            DocumentEvent::Ack { request_id, .. } | DocumentEvent::Nack { request_id, .. } => {
                Some(request_id)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_request_wire_shape() {
        let request = DocumentRequest::SyncRequest {
            protocol_version: DOCUMENT_PROTOCOL_VERSION,
        };
        assert_eq!(
            request.to_value().unwrap(),
            json!({"type": "sync_request", "protocol_version": 1})
        );
        assert_eq!(request.request_id(), None);
    }

    #[test]
    fn test_append_output_request() {
        let request = DocumentRequest::AppendOutput {
            request_id: "r1".into(),
            cell_id: CellId::from("c1"),
            output: Output::stdout("hi"),
        };
        let value = request.to_value().unwrap();
        assert_eq!(value["type"], "append_output");
        assert_eq!(value["output"]["output_type"], "stream");
        assert_eq!(DocumentRequest::from_value(value).unwrap(), request);
    }

    #[test]
    fn test_parse_ack_and_nack() {
        let ack = DocumentEvent::from_value(json!({"type": "ack", "request_id": "r1", "index": 4}))
            .unwrap();
        assert_eq!(
            ack,
            DocumentEvent::Ack {
                request_id: "r1".into(),
                index: Some(4)
            }
        );
        assert_eq!(ack.request_id(), Some("r1"));

        let nack = DocumentEvent::from_value(
            json!({"type": "nack", "request_id": "r2", "reason": "cell_not_found"}),
        )
        .unwrap();
        assert!(matches!(
            nack,
            DocumentEvent::Nack {
                reason: NackReason::CellNotFound,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_unknown_event_is_protocol_error() {
        let err = DocumentEvent::from_value(json!({"type": "presence", "user": "x"})).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_cell_update_apply() {
        let mut cell = Cell::code("x");
        cell.outputs.push(Output::stdout("old"));

        CellUpdate::clear_outputs().apply(&mut cell);
        assert!(cell.outputs.is_empty());
        assert_eq!(cell.execution_count, None);

        CellUpdate::execution_count(7).apply(&mut cell);
        assert_eq!(cell.execution_count, Some(7));

        cell.outputs.push(Output::stdout("0%"));
        CellUpdate::replace_outputs(vec![Output::stdout("100%")]).apply(&mut cell);
        assert_eq!(cell.rendered_outputs(), vec!["100%".to_string()]);
        assert_eq!(cell.execution_count, Some(7));
    }

    #[test]
    fn test_cell_update_omits_unset_outputs() {
        let value = serde_json::to_value(CellUpdate::clear_outputs()).unwrap();
        assert_eq!(value, json!({"clear_outputs": true}));
    }
}
