//! MCP Tool Types
//!
//! Parameter and response types of the notebook tools. Responses mirror the
//! session crate's result types with JSON schemas attached.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use notebook_mcp_session::{CellSummary, ErrorInfo, ExecutionResult, NotebookContent};

// =============================================================================
// Execution Tools
// =============================================================================

/// Parameters for notebook_execute_code
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    /// Code to append as a new cell and execute
    pub code: String,

    /// Maximum time to wait for the execution in milliseconds.
    /// Defaults to the server's configured timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Exception raised by the executed code
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionError {
    /// Exception class name (e.g. "ValueError")
    pub kind: String,

    /// Exception message
    pub message: String,

    /// Traceback lines
    pub traceback: Vec<String>,
}

impl From<ErrorInfo> for ExecutionError {
    fn from(info: ErrorInfo) -> Self {
        Self {
            kind: info.kind,
            message: info.message,
            traceback: info.traceback,
        }
    }
}

/// Response for notebook_execute_code
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteCodeResponse {
    /// Id of the cell the code was written to
    pub cell_id: String,

    /// Printed output followed by the value of the last expression
    pub text: String,

    /// Rich display outputs as mime bundles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub displays: Vec<serde_json::Value>,

    /// Raised exception, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    /// True when the execution was interrupted at the deadline
    pub incomplete: bool,

    /// Why the result is incomplete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Kernel execution counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,

    /// Text rendering of every output, in order
    pub outputs: Vec<String>,

    /// Wall time of the call in milliseconds
    pub elapsed_ms: u64,
}

impl From<ExecutionResult> for ExecuteCodeResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            cell_id: result.cell_id.to_string(),
            text: result.text,
            displays: result
                .displays
                .into_iter()
                .map(serde_json::Value::Object)
                .collect(),
            error: result.error.map(ExecutionError::from),
            incomplete: result.incomplete,
            reason: result.reason,
            execution_count: result.execution_count,
            outputs: result.outputs,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

// =============================================================================
// Document Tools
// =============================================================================

/// Parameters for notebook_add_markdown
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AddMarkdownParams {
    /// Markdown source of the new cell
    pub content: String,
}

/// Response for notebook_add_markdown
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AddMarkdownResponse {
    /// Id of the new cell
    pub cell_id: String,

    /// Success message
    pub message: String,
}

/// Parameters for notebook_read
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadParams {}

/// One cell in a notebook_read response
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CellInfo {
    /// Position in the notebook
    pub index: usize,

    /// Cell id
    pub id: String,

    /// Cell type: code, markdown or raw
    #[serde(rename = "type")]
    pub cell_type: String,

    /// Cell source
    pub content: String,

    /// Rendered outputs (code cells only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    /// Execution counter (code cells only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
}

impl From<CellSummary> for CellInfo {
    fn from(cell: CellSummary) -> Self {
        Self {
            index: cell.index,
            id: cell.id.to_string(),
            cell_type: cell.cell_type,
            content: cell.content,
            outputs: cell.outputs,
            execution_count: cell.execution_count,
        }
    }
}

/// Response for notebook_read
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadResponse {
    /// Cells in document order
    pub cells: Vec<CellInfo>,

    /// Number of cells
    pub total_cells: usize,
}

impl From<NotebookContent> for ReadResponse {
    fn from(content: NotebookContent) -> Self {
        Self {
            total_cells: content.total_cells,
            cells: content.cells.into_iter().map(CellInfo::from).collect(),
        }
    }
}

// =============================================================================
// Kernel Tools
// =============================================================================

/// Parameters for notebook_kernel_restart
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KernelRestartParams {}

/// Response for notebook_kernel_restart
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KernelRestartResponse {
    /// Success message
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notebook_mcp_core::{Cell, CellId};

    #[test]
    fn test_execute_params_optional_timeout() {
        let params: ExecuteCodeParams = serde_json::from_str(r#"{"code": "1+1"}"#).unwrap();
        assert_eq!(params.code, "1+1");
        assert!(params.timeout_ms.is_none());

        let params: ExecuteCodeParams =
            serde_json::from_str(r#"{"code": "x", "timeout_ms": 500}"#).unwrap();
        assert_eq!(params.timeout_ms, Some(500));
    }

    #[test]
    fn test_execute_response_from_result() {
        let result = ExecutionResult {
            cell_id: CellId::from("c1"),
            text: "2".into(),
            displays: vec![],
            error: Some(ErrorInfo {
                kind: "ValueError".into(),
                message: "x".into(),
                traceback: vec!["ValueError: x".into()],
            }),
            incomplete: false,
            reason: None,
            execution_count: Some(1),
            outputs: vec!["2".into()],
            elapsed_ms: 3,
        };
        let response = ExecuteCodeResponse::from(result);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["cell_id"], "c1");
        assert_eq!(value["error"]["kind"], "ValueError");
        assert!(value.get("displays").is_none());
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn test_read_response_uses_type_key() {
        let content = NotebookContent::from_cells(&[Cell::markdown("# Title")]);
        let value = serde_json::to_value(ReadResponse::from(content)).unwrap();
        assert_eq!(value["total_cells"], 1);
        assert_eq!(value["cells"][0]["type"], "markdown");
        assert_eq!(value["cells"][0]["content"], "# Title");
    }

    #[test]
    fn test_params_schema() {
        let schema = schemars::schema_for!(ExecuteCodeParams);
        let value = serde_json::to_value(&schema).unwrap();
        assert!(value["properties"]["code"].is_object());
        assert!(value["properties"]["timeout_ms"].is_object());
    }
}
