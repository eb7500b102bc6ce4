//! Notebook MCP Server Implementation
//!
//! This module implements the MCP server using rmcp 0.9's #[tool_router] pattern.
//! Every tool call is one blocking unit of work on the execution bridge.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData as McpError,
};

use tracing::{error, info, instrument, warn};

use notebook_mcp_core::Error;
use notebook_mcp_session::ExecutionBridge;

use crate::tools::*;

/// Map a bridge error to an MCP error, logging it first.
fn to_mcp_error(action: &str, e: Error) -> McpError {
    error!("Failed to {}: {}", action, e);
    let code = match e {
        Error::InvalidInput(_) => ErrorCode(-32602), // Invalid params
        _ => ErrorCode(-32603),                      // Internal error
    };
    McpError::new(code, format!("Failed to {action}: {e}"), None)
}

fn json_result<T: serde::Serialize>(response: &T, fallback: impl FnOnce() -> String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(response).unwrap_or_else(|_| fallback()),
    )])
}

/// Notebook MCP Server
///
/// Exposes one notebook document and its kernel via MCP tools.
#[derive(Clone)]
pub struct NotebookMcpServer {
    /// Bridge shared by every tool call
    bridge: Arc<ExecutionBridge>,
    /// Tool router for handling MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl NotebookMcpServer {
    /// Create a server over an execution bridge
    pub fn new(bridge: Arc<ExecutionBridge>) -> Self {
        Self {
            bridge,
            tool_router: Self::tool_router(),
        }
    }

    /// The underlying execution bridge
    pub fn bridge(&self) -> &Arc<ExecutionBridge> {
        &self.bridge
    }

    /// Append a code cell and execute it
    #[tool(
        description = "Append a code cell to the notebook, execute it on the kernel and return its output. \
                       Returns text (printed output and last expression value), error details if the code \
                       raised, and incomplete=true if the timeout was reached and execution was interrupted."
    )]
    #[instrument(skip_all)]
    pub async fn notebook_execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            "Executing code: {} bytes, timeout_ms={:?}",
            params.code.len(),
            params.timeout_ms
        );

        let timeout = params.timeout_ms.map(Duration::from_millis);
        let result = self
            .bridge
            .run_code(&params.code, timeout)
            .await
            .map_err(|e| to_mcp_error("execute code", e))?;

        if result.incomplete {
            warn!(
                "Execution incomplete: cell={}, reason={:?}",
                result.cell_id, result.reason
            );
        }

        let response = ExecuteCodeResponse::from(result);
        Ok(json_result(&response, || response.text.clone()))
    }

    /// Append a markdown cell
    #[tool(description = "Append a markdown cell to the notebook")]
    #[instrument(skip_all)]
    pub async fn notebook_add_markdown(
        &self,
        Parameters(params): Parameters<AddMarkdownParams>,
    ) -> Result<CallToolResult, McpError> {
        let cell_id = self
            .bridge
            .add_markdown(&params.content)
            .await
            .map_err(|e| to_mcp_error("add markdown cell", e))?;

        let response = AddMarkdownResponse {
            cell_id: cell_id.to_string(),
            message: format!("Markdown cell {cell_id} added"),
        };
        Ok(json_result(&response, || response.cell_id.clone()))
    }

    /// Read every cell of the notebook
    #[tool(
        description = "Read the notebook: every cell with its index, id, type, source and rendered outputs"
    )]
    #[instrument(skip_all)]
    pub async fn notebook_read(
        &self,
        Parameters(_params): Parameters<ReadParams>,
    ) -> Result<CallToolResult, McpError> {
        let content = self
            .bridge
            .read_notebook()
            .await
            .map_err(|e| to_mcp_error("read notebook", e))?;

        info!("Notebook read: {} cells", content.total_cells);
        let response = ReadResponse::from(content);
        Ok(json_result(&response, || {
            format!("{} cells", response.total_cells)
        }))
    }

    /// Restart the kernel
    #[tool(
        description = "Restart the notebook's kernel. All variables and imports are lost; \
                       the execution counter starts over."
    )]
    #[instrument(skip_all)]
    pub async fn notebook_kernel_restart(
        &self,
        Parameters(_params): Parameters<KernelRestartParams>,
    ) -> Result<CallToolResult, McpError> {
        self.bridge
            .restart_kernel()
            .await
            .map_err(|e| to_mcp_error("restart kernel", e))?;

        info!("Kernel restarted");
        let response = KernelRestartResponse {
            message: "Kernel restarted".to_string(),
        };
        Ok(json_result(&response, || response.message.clone()))
    }
}

// Implement the ServerHandler trait to define server capabilities
#[tool_handler]
impl rmcp::ServerHandler for NotebookMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Notebook MCP Server - Run code in a live, collaborative Jupyter notebook. \
                 Use notebook_execute_code to append and run a code cell, notebook_add_markdown \
                 to add notes, notebook_read to see every cell and notebook_kernel_restart to \
                 reset kernel state. Calls run one at a time; a concurrent call is rejected as busy."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notebook_mcp_core::ServerConfig;
    use notebook_mcp_session::{FakeDocumentStore, FakeKernel};
    use notebook_mcp_transport::MemoryConnector;

    fn server() -> NotebookMcpServer {
        let connector = MemoryConnector::new(
            Arc::new(FakeDocumentStore::new("notebook.ipynb")),
            Arc::new(FakeKernel::new()),
        );
        let config = ServerConfig::default().session_config().unwrap();
        NotebookMcpServer::new(Arc::new(ExecutionBridge::new(Arc::new(connector), config)))
    }

    fn body(result: &CallToolResult) -> serde_json::Value {
        let text = result
            .content
            .iter()
            .find_map(|c| c.as_text().map(|t| t.text.clone()))
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_error_codes() {
        let err = to_mcp_error("x", Error::InvalidInput("bad".into()));
        assert_eq!(err.code, ErrorCode(-32602));
        let err = to_mcp_error("x", Error::Busy);
        assert_eq!(err.code, ErrorCode(-32603));
        assert!(err.message.contains("Busy"));
    }

    #[tokio::test]
    async fn test_execute_code_tool() {
        let server = server();
        let result = server
            .notebook_execute_code(Parameters(ExecuteCodeParams {
                code: "print('hi')".into(),
                timeout_ms: None,
            }))
            .await
            .unwrap();

        let value = body(&result);
        assert_eq!(value["text"], "hi\n");
        assert_eq!(value["incomplete"], false);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_zero_timeout_is_invalid_params() {
        let server = server();
        let err = server
            .notebook_execute_code(Parameters(ExecuteCodeParams {
                code: "1".into(),
                timeout_ms: Some(0),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode(-32602));
    }

    #[tokio::test]
    async fn test_markdown_then_read() {
        let server = server();
        let added = body(
            &server
                .notebook_add_markdown(Parameters(AddMarkdownParams {
                    content: "# Notes".into(),
                }))
                .await
                .unwrap(),
        );
        let read = body(&server.notebook_read(Parameters(ReadParams {})).await.unwrap());

        assert_eq!(read["total_cells"], 1);
        assert_eq!(read["cells"][0]["id"], added["cell_id"]);
        assert_eq!(read["cells"][0]["type"], "markdown");
    }

    #[test]
    fn test_server_info() {
        let info = rmcp::ServerHandler::get_info(&server());
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("notebook_execute_code"));
    }
}
