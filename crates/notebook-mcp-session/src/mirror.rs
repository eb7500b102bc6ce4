//! Local, eventually consistent copy of the notebook document.
//!
//! The store is the source of truth. The mirror is rebuilt from every
//! snapshot and patched by change events and by acknowledged local writes.
//! Ids of cells that disappear are kept as tombstones so that later
//! references to them are reported as stale rather than unknown.

use std::collections::HashSet;

use tracing::debug;

use notebook_mcp_core::protocol::{CellUpdate, DocumentEvent};
use notebook_mcp_core::{Cell, CellId, Error, Output, Result};

/// What applying an event did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEffect {
    /// Mirror replaced by a snapshot
    Reset {
        /// Number of cells after the reset
        cells: usize,
    },
    /// A cell was inserted
    Inserted(CellId),
    /// A cell's content changed
    Updated(CellId),
    /// A cell was removed
    Deleted(CellId),
    /// An output was appended
    OutputAppended(CellId),
    /// A cell's outputs were removed
    OutputsCleared(CellId),
    /// The whole document is gone
    DocumentDeleted,
    /// Nothing changed (ack, nack, error, or an event for an unknown cell)
    Ignored,
}

/// Ordered cells plus deletion tombstones.
#[derive(Debug, Default, Clone)]
pub struct NotebookMirror {
    cells: Vec<Cell>,
    version: u64,
    tombstones: HashSet<CellId>,
}

impl NotebookMirror {
    /// Create an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cells in document order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the mirror holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Store version of the last snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Position of a cell.
    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|cell| &cell.id == id)
    }

    /// Look up a cell without error mapping.
    pub fn get(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|cell| &cell.id == id)
    }

    /// Look up a cell: `StaleReference` if it was deleted, `NotFound` if never seen.
    pub fn lookup(&self, id: &CellId) -> Result<&Cell> {
        if let Some(cell) = self.get(id) {
            return Ok(cell);
        }
        if self.tombstones.contains(id) {
            Err(Error::StaleReference(id.clone()))
        } else {
            Err(Error::NotFound(format!("cell '{id}'")))
        }
    }

    /// Whether a cell was seen and then removed.
    pub fn is_deleted(&self, id: &CellId) -> bool {
        self.tombstones.contains(id)
    }

    /// Replace the contents with a snapshot.
    ///
    /// Cells present before but missing from the snapshot become tombstones.
    pub fn install_snapshot(&mut self, version: u64, cells: Vec<Cell>) {
        let incoming: HashSet<&CellId> = cells.iter().map(|cell| &cell.id).collect();
        for cell in &self.cells {
            if !incoming.contains(&cell.id) {
                self.tombstones.insert(cell.id.clone());
            }
        }
        for cell in &cells {
            self.tombstones.remove(&cell.id);
        }
        self.cells = cells;
        self.version = version;
    }

    /// Insert a cell at `index` (clamped), or at the end when `index` is `None`.
    ///
    /// A cell with the same id is replaced rather than duplicated.
    pub fn insert(&mut self, index: Option<usize>, cell: Cell) {
        if let Some(existing) = self.position(&cell.id) {
            self.cells.remove(existing);
        }
        let index = index.unwrap_or(self.cells.len()).min(self.cells.len());
        self.tombstones.remove(&cell.id);
        self.cells.insert(index, cell);
    }

    /// Append an output to a cell.
    pub fn append_output(&mut self, id: &CellId, output: Output) -> Result<()> {
        self.cell_mut(id)?.outputs.push(output);
        Ok(())
    }

    /// Apply a partial update to a cell.
    pub fn update(&mut self, id: &CellId, update: &CellUpdate) -> Result<()> {
        update.apply(self.cell_mut(id)?);
        Ok(())
    }

    /// Remove a cell, keeping a tombstone.
    pub fn remove(&mut self, id: &CellId) -> Option<Cell> {
        let index = self.position(id)?;
        self.tombstones.insert(id.clone());
        Some(self.cells.remove(index))
    }

    /// Drop every cell, tombstoning all of them.
    pub fn clear(&mut self) {
        for cell in self.cells.drain(..) {
            self.tombstones.insert(cell.id);
        }
    }

    /// Apply an upstream event.
    pub fn apply(&mut self, event: DocumentEvent) -> MirrorEffect {
        match event {
            DocumentEvent::Snapshot { version, cells, .. } => {
                self.install_snapshot(version, cells);
                MirrorEffect::Reset {
                    cells: self.cells.len(),
                }
            }
            DocumentEvent::CellInserted { index, cell } => {
                let id = cell.id.clone();
                self.insert(Some(index), cell);
                MirrorEffect::Inserted(id)
            }
            DocumentEvent::CellUpdated { cell } => match self.position(&cell.id) {
                Some(index) => {
                    let id = cell.id.clone();
                    self.cells[index] = cell;
                    MirrorEffect::Updated(id)
                }
                None => {
                    debug!("Ignoring update for unknown cell: id={}", cell.id);
                    MirrorEffect::Ignored
                }
            },
            DocumentEvent::CellDeleted { cell_id } => match self.remove(&cell_id) {
                Some(_) => MirrorEffect::Deleted(cell_id),
                None => {
                    self.tombstones.insert(cell_id);
                    MirrorEffect::Ignored
                }
            },
            DocumentEvent::OutputAppended { cell_id, output } => {
                match self.append_output(&cell_id, output) {
                    Ok(()) => MirrorEffect::OutputAppended(cell_id),
                    Err(_) => MirrorEffect::Ignored,
                }
            }
            DocumentEvent::OutputsCleared { cell_id } => {
                match self.update(&cell_id, &CellUpdate::clear_outputs()) {
                    Ok(()) => MirrorEffect::OutputsCleared(cell_id),
                    Err(_) => MirrorEffect::Ignored,
                }
            }
            DocumentEvent::DocumentDeleted => {
                self.clear();
                MirrorEffect::DocumentDeleted
            }
            DocumentEvent::Ack { .. } | DocumentEvent::Nack { .. } | DocumentEvent::Error { .. } => {
                MirrorEffect::Ignored
            }
        }
    }

    fn cell_mut(&mut self, id: &CellId) -> Result<&mut Cell> {
        if self.tombstones.contains(id) && self.get(id).is_none() {
            return Err(Error::StaleReference(id.clone()));
        }
        self.cells
            .iter_mut()
            .find(|cell| &cell.id == id)
            .ok_or_else(|| Error::NotFound(format!("cell '{id}'")))
    }
}
