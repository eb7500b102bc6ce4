//! Per-call execution state and the results handed back to callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use notebook_mcp_core::{strip_ansi, Cell, CellId, MimeBundle, Output};

/// Correlation state of one bridge run.
///
/// Created when a run starts and consumed into an [`ExecutionResult`].
#[derive(Debug)]
pub struct ExecutionSession {
    cell_id: CellId,
    msg_id: Option<String>,
    started: Instant,
    deadline: Instant,
    outputs: Vec<Output>,
    /// `display_id` of each output, parallel to `outputs`
    display_ids: Vec<Option<String>>,
    clear_pending: bool,
    execution_count: Option<u32>,
}

impl ExecutionSession {
    /// Start a run for `cell_id` that must finish within `timeout`.
    pub fn new(cell_id: CellId, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            cell_id,
            msg_id: None,
            started,
            deadline: started + timeout,
            outputs: Vec::new(),
            display_ids: Vec::new(),
            clear_pending: false,
            execution_count: None,
        }
    }

    /// Target cell.
    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// Kernel `msg_id` of the execution, once submitted.
    pub fn msg_id(&self) -> Option<&str> {
        self.msg_id.as_deref()
    }

    /// Record the kernel `msg_id`.
    pub fn set_msg_id(&mut self, msg_id: impl Into<String>) {
        self.msg_id = Some(msg_id.into());
    }

    /// When the run must give up.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Outputs collected so far.
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Record an output. Returns `true` if a deferred clear was applied first.
    pub fn push(&mut self, output: Output) -> bool {
        self.record(output, None)
    }

    /// Record a display output that later updates may replace.
    pub fn push_display(&mut self, display_id: impl Into<String>, output: Output) -> bool {
        self.record(output, Some(display_id.into()))
    }

    /// Replace every output shown under `display_id`. Returns `true` if any was.
    pub fn update_display(&mut self, display_id: &str, output: Output) -> bool {
        let mut replaced = false;
        for (slot, id) in self.outputs.iter_mut().zip(&self.display_ids) {
            if id.as_deref() == Some(display_id) {
                *slot = output.clone();
                replaced = true;
            }
        }
        replaced
    }

    fn record(&mut self, output: Output, display_id: Option<String>) -> bool {
        let cleared = std::mem::take(&mut self.clear_pending);
        if cleared {
            self.outputs.clear();
            self.display_ids.clear();
        }
        if let Output::ExecuteResult {
            execution_count: Some(count),
            ..
        } = &output
        {
            self.execution_count = Some(*count);
        }
        self.outputs.push(output);
        self.display_ids.push(display_id);
        cleared
    }

    /// Handle `clear_output`. Returns `true` if outputs were cleared now.
    pub fn clear(&mut self, wait: bool) -> bool {
        if wait {
            self.clear_pending = true;
            false
        } else {
            self.clear_pending = false;
            self.outputs.clear();
            self.display_ids.clear();
            true
        }
    }

    /// Record the execution counter reported at completion.
    pub fn complete(&mut self, execution_count: Option<u32>) {
        if execution_count.is_some() {
            self.execution_count = execution_count;
        }
    }

    /// Execution counter, if known.
    pub fn execution_count(&self) -> Option<u32> {
        self.execution_count
    }

    /// Build the result. `reason` marks the run incomplete.
    pub fn finish(self, reason: Option<String>) -> ExecutionResult {
        let mut text = String::new();
        let mut result_text = None;
        let mut displays = Vec::new();
        let mut error = None;

        for output in &self.outputs {
            match output {
                Output::Stream { text: chunk, .. } => text.push_str(chunk),
                Output::DisplayData { data, .. } => displays.push(data.clone()),
                Output::ExecuteResult { data, .. } => {
                    result_text = data.get("text/plain").map(|_| output.render());
                    displays.push(data.clone());
                }
                Output::Error {
                    ename,
                    evalue,
                    traceback,
                } => {
                    error = Some(ErrorInfo {
                        kind: ename.clone(),
                        message: if evalue.is_empty() {
                            ename.clone()
                        } else {
                            evalue.clone()
                        },
                        traceback: traceback.iter().map(|line| strip_ansi(line)).collect(),
                    });
                }
            }
        }
        if let Some(value) = result_text {
            text.push_str(&value);
        }

        ExecutionResult {
            cell_id: self.cell_id,
            text,
            displays,
            error,
            incomplete: reason.is_some(),
            reason,
            execution_count: self.execution_count,
            outputs: self.outputs.iter().map(Output::render).collect(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Exception raised by executed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Exception class name
    pub kind: String,
    /// Exception message
    pub message: String,
    /// Traceback lines without ANSI colour codes
    pub traceback: Vec<String>,
}

/// Aggregated outcome of one code run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Cell the code was written to
    pub cell_id: CellId,
    /// Stream text followed by the plain-text value of the final expression
    pub text: String,
    /// Mime bundles of display and result outputs
    pub displays: Vec<MimeBundle>,
    /// Raised exception, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Whether the run stopped before the kernel finished
    pub incomplete: bool,
    /// Why the run is incomplete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Execution counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    /// Textual rendering of every output, in order
    pub outputs: Vec<String>,
    /// Wall time of the run
    pub elapsed_ms: u64,
}

/// Summary of one cell for `read_notebook`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    /// Position in the document
    pub index: usize,
    /// Cell id
    pub id: CellId,
    /// `code`, `markdown` or `raw`
    #[serde(rename = "type")]
    pub cell_type: String,
    /// Source text
    pub content: String,
    /// Rendered outputs (code cells only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    /// Execution counter (code cells only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
}

impl CellSummary {
    /// Summarize a cell at `index`.
    pub fn from_cell(index: usize, cell: &Cell) -> Self {
        Self {
            index,
            id: cell.id.clone(),
            cell_type: cell.cell_type.as_str().to_string(),
            content: cell.source.clone(),
            outputs: cell.is_code().then(|| cell.rendered_outputs()),
            execution_count: cell.execution_count,
        }
    }
}

/// Whole-document view for `read_notebook`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookContent {
    /// Cells in document order
    pub cells: Vec<CellSummary>,
    /// Number of cells
    pub total_cells: usize,
}

impl NotebookContent {
    /// Summarize an ordered list of cells.
    pub fn from_cells(cells: &[Cell]) -> Self {
        let cells: Vec<CellSummary> = cells
            .iter()
            .enumerate()
            .map(|(index, cell)| CellSummary::from_cell(index, cell))
            .collect();
        Self {
            total_cells: cells.len(),
            cells,
        }
    }
}
