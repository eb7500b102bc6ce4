//! Notebook cell types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Output;

/// Identifier of a notebook cell.
///
/// Cells created by other collaborators carry whatever id the store assigned,
/// so this is a string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Create a new random cell ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    /// Executable code
    Code,
    /// Markdown text
    Markdown,
    /// Raw, unrendered text
    Raw,
}

impl CellType {
    /// nbformat name of the cell type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Raw => "raw",
        }
    }
}

/// A single notebook cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Cell {
    /// Cell identifier
    pub id: CellId,
    /// Cell type
    pub cell_type: CellType,
    /// Source text
    pub source: String,
    /// Execution outputs in arrival order (code cells only)
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Execution counter, unset until the cell has run
    #[serde(default)]
    pub execution_count: Option<u32>,
}

impl Cell {
    /// Create a new code cell with a fresh id.
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(),
            cell_type: CellType::Code,
            source: source.into(),
            outputs: Vec::new(),
            execution_count: None,
        }
    }

    /// Create a new markdown cell with a fresh id.
    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Markdown,
            ..Self::code(source)
        }
    }

    /// Whether the cell holds executable code.
    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    /// Textual rendering of every output, in order.
    pub fn rendered_outputs(&self) -> Vec<String> {
        self.outputs.iter().map(Output::render).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_id_unique() {
        assert_ne!(CellId::new(), CellId::new());
    }

    #[test]
    fn test_cell_id_display() {
        let id = CellId::from("cell-1");
        assert_eq!(id.to_string(), "cell-1");
        assert_eq!(id.as_str(), "cell-1");
    }

    #[test]
    fn test_code_cell() {
        let cell = Cell::code("1+1");
        assert!(cell.is_code());
        assert_eq!(cell.source, "1+1");
        assert!(cell.outputs.is_empty());
        assert_eq!(cell.execution_count, None);
    }

    #[test]
    fn test_markdown_cell() {
        let cell = Cell::markdown("# Title");
        assert_eq!(cell.cell_type, CellType::Markdown);
        assert!(!cell.is_code());
    }

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::code("print('hi')");
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["cell_type"], "code");
        assert_eq!(json["id"], cell.id.as_str());

        // Outputs and execution_count are optional on the wire
        let parsed: Cell = serde_json::from_str(
            r#"{"id": "x", "cell_type": "markdown", "source": "hello"}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, CellId::from("x"));
        assert!(parsed.outputs.is_empty());
    }
}
