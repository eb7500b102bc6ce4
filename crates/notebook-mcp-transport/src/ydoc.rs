//! Jupyter collaboration rooms: Y-sync over a binary WebSocket.
//!
//! A room holds a Yjs document in the jupyter_ydoc notebook layout: a root
//! `cells` array whose items are maps with `id`, `cell_type`, `source`
//! (text), `metadata` (map), and for code cells `outputs` (array) and
//! `execution_count`.
//!
//! [`YNotebookChannel`] keeps a local replica of that document and speaks the
//! JSON document contract of [`notebook_mcp_core::protocol`] to its caller.
//! Requests become local transactions whose updates are sent to the room and
//! acknowledged once sent; remote updates become change events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use tracing::{debug, info, warn};
use yrs::sync::{Message, SyncMessage};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array as _, ArrayPrelim, ArrayRef, Doc, Map as _, MapPrelim, MapRef, Out, ReadTxn,
    TextPrelim, Transact, TransactionMut, Update,
};

use notebook_mcp_core::protocol::{
    CellUpdate, DocumentEvent, DocumentRequest, NackReason, DOCUMENT_PROTOCOL_VERSION,
};
use notebook_mcp_core::{Cell, CellId, Error, Output, Result};

use crate::channel::{Channel, FrameChannel};

/// Name of the root array holding the cells.
const CELLS: &str = "cells";

/// Document channel over a Y-sync room.
pub struct YNotebookChannel<F> {
    frames: F,
    doc: Doc,
    /// Cells as last reported to the caller
    known: Vec<Cell>,
    /// Remote updates applied so far
    version: u64,
    /// A `sync_request` is waiting for the room's SyncStep2
    syncing: bool,
    events: VecDeque<DocumentEvent>,
    /// Encoded messages not yet sent
    outbox: VecDeque<Vec<u8>>,
}

impl<F> std::fmt::Debug for YNotebookChannel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YNotebookChannel")
            .field("cells", &self.known.len())
            .field("version", &self.version)
            .field("syncing", &self.syncing)
            .finish()
    }
}

impl<F: FrameChannel> YNotebookChannel<F> {
    /// Wrap an open room connection. The replica starts empty.
    pub fn new(frames: F) -> Self {
        Self {
            frames,
            doc: Doc::new(),
            known: Vec::new(),
            version: 0,
            syncing: false,
            events: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Cells of the local replica in document order.
    pub fn cells(&self) -> Vec<Cell> {
        let cells = self.doc.get_or_insert_array(CELLS);
        let txn = self.doc.transact();
        read_cells(&txn, &cells)
    }

    /// Send queued messages, oldest first. A message leaves the queue only
    /// once sent, so a cancelled flush loses nothing.
    async fn flush(&mut self) -> Result<()> {
        while let Some(frame) = self.outbox.front() {
            self.frames.send_frame(frame.clone()).await?;
            self.outbox.pop_front();
        }
        Ok(())
    }

    async fn send_update(&mut self, update: Vec<u8>) -> Result<()> {
        self.outbox
            .push_back(Message::Sync(SyncMessage::Update(update)).encode_v1());
        self.flush().await
    }

    /// Run a local transaction and return its outcome and encoded update.
    fn write<R>(
        &mut self,
        edit: impl FnOnce(&mut TransactionMut<'_>, &ArrayRef) -> Option<R>,
    ) -> (Option<R>, Vec<u8>) {
        let cells = self.doc.get_or_insert_array(CELLS);
        let before = self.doc.transact().state_vector();
        let outcome = {
            let mut txn = self.doc.transact_mut();
            edit(&mut txn, &cells)
        };
        let update = self.doc.transact().encode_diff_v1(&before);
        self.known = self.cells();
        (outcome, update)
    }

    /// Apply a cell write; nack if the cell is gone.
    async fn write_cell(
        &mut self,
        request_id: String,
        cell_id: &CellId,
        edit: impl FnOnce(&mut TransactionMut<'_>, &MapRef),
    ) -> Result<()> {
        let (found, update) = self.write(|txn, cells| {
            let cell = find_cell(&*txn, cells, cell_id)?;
            edit(txn, &cell);
            Some(())
        });
        if found.is_none() {
            debug!("Write to missing cell refused: id={}", cell_id);
            self.events.push_back(DocumentEvent::Nack {
                request_id,
                reason: NackReason::CellNotFound,
            });
            return Ok(());
        }
        self.send_update(update).await?;
        self.events.push_back(DocumentEvent::Ack {
            request_id,
            index: None,
        });
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let message = match Message::decode_v1(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping undecodable room message: {}", e);
                return;
            }
        };
        match message {
            Message::Sync(SyncMessage::SyncStep1(remote)) => {
                let diff = self.doc.transact().encode_diff_v1(&remote);
                self.outbox
                    .push_back(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1());
            }
            Message::Sync(SyncMessage::SyncStep2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                if let Err(e) = self.apply_remote(&update) {
                    warn!("Skipping room update: {}", e);
                }
            }
            Message::Auth(Some(reason)) => {
                self.events.push_back(DocumentEvent::Error {
                    code: "forbidden".into(),
                    message: reason,
                });
            }
            _ => debug!("Ignoring non-sync room message"),
        }
    }

    fn apply_remote(&mut self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| Error::Protocol(format!("invalid Y update: {e}")))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| Error::Protocol(format!("cannot apply Y update: {e}")))?;
        self.version += 1;

        let cells = self.cells();
        if std::mem::take(&mut self.syncing) {
            info!("Room synchronized: cells={}", cells.len());
            self.events.push_back(DocumentEvent::Snapshot {
                protocol_version: DOCUMENT_PROTOCOL_VERSION,
                version: self.version,
                cells: cells.clone(),
            });
        } else {
            let changes = diff_cells(&self.known, &cells).unwrap_or_else(|| {
                debug!("Cells reordered upstream, sending a snapshot");
                vec![DocumentEvent::Snapshot {
                    protocol_version: DOCUMENT_PROTOCOL_VERSION,
                    version: self.version,
                    cells: cells.clone(),
                }]
            });
            self.events.extend(changes);
        }
        self.known = cells;
        Ok(())
    }
}

#[async_trait]
impl<F: FrameChannel> Channel for YNotebookChannel<F> {
    async fn send(&mut self, message: Value) -> Result<()> {
        self.flush().await?;
        match DocumentRequest::from_value(message)? {
            DocumentRequest::SyncRequest { .. } => {
                let state = self.doc.transact().state_vector();
                self.syncing = true;
                self.outbox
                    .push_back(Message::Sync(SyncMessage::SyncStep1(state)).encode_v1());
                self.flush().await
            }
            DocumentRequest::InsertCell { request_id, cell } => {
                let (index, update) = self.write(|txn, cells| {
                    let index = cells.len(&*txn);
                    insert_cell(txn, cells, index, &cell);
                    Some(index as usize)
                });
                self.send_update(update).await?;
                self.events.push_back(DocumentEvent::Ack { request_id, index });
                Ok(())
            }
            DocumentRequest::AppendOutput {
                request_id,
                cell_id,
                output,
            } => {
                let output = output_any(&output)?;
                self.write_cell(request_id, &cell_id, |txn, cell| {
                    outputs_of(txn, cell).push_back(txn, output);
                })
                .await
            }
            DocumentRequest::UpdateCell {
                request_id,
                cell_id,
                update,
            } => {
                let replacement = match &update.outputs {
                    Some(outputs) => Some(outputs.iter().map(output_any).collect::<Result<Vec<_>>>()?),
                    None => None,
                };
                self.write_cell(request_id, &cell_id, |txn, cell| {
                    update_cell(txn, cell, &update, replacement);
                })
                .await
            }
        }
    }

    async fn recv(&mut self) -> Option<Result<Value>> {
        loop {
            if let Err(e) = self.flush().await {
                return Some(Err(e));
            }
            if let Some(event) = self.events.pop_front() {
                return Some(event.to_value());
            }
            match self.frames.recv_frame().await? {
                Ok(frame) => self.handle_frame(&frame),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&mut self) {
        self.frames.shutdown().await;
    }
}

// =============================================================================
// Notebook layout
// =============================================================================

fn text(value: &str) -> Any {
    Any::String(Arc::from(value))
}

fn insert_cell(txn: &mut TransactionMut<'_>, cells: &ArrayRef, index: u32, cell: &Cell) {
    let map: MapRef = cells.insert(txn, index, MapPrelim::default());
    map.insert(txn, "id", text(cell.id.as_str()));
    map.insert(txn, "cell_type", text(cell.cell_type.as_str()));
    map.insert(txn, "source", TextPrelim::new(cell.source.clone()));
    map.insert(txn, "metadata", MapPrelim::default());
    if cell.is_code() {
        let count = cell
            .execution_count
            .map_or(Any::Null, |count| Any::BigInt(i64::from(count)));
        map.insert(txn, "execution_count", count);
        let outputs: ArrayRef = map.insert(txn, "outputs", ArrayPrelim::default());
        for output in &cell.outputs {
            match output_any(output) {
                Ok(value) => {
                    outputs.push_back(txn, value);
                }
                Err(e) => warn!("Dropping unencodable output of cell {}: {}", cell.id, e),
            }
        }
    }
}

fn update_cell(
    txn: &mut TransactionMut<'_>,
    cell: &MapRef,
    update: &CellUpdate,
    replacement: Option<Vec<Any>>,
) {
    let outputs = outputs_of(txn, cell);
    if update.clear_outputs || replacement.is_some() {
        let len = outputs.len(&*txn);
        if len > 0 {
            outputs.remove_range(txn, 0, len);
        }
    }
    for output in replacement.into_iter().flatten() {
        outputs.push_back(txn, output);
    }
    if let Some(count) = update.execution_count {
        cell.insert(txn, "execution_count", Any::BigInt(i64::from(count)));
    }
}

/// The `outputs` array of a cell, created if missing.
fn outputs_of(txn: &mut TransactionMut<'_>, cell: &MapRef) -> ArrayRef {
    match cell.get(&*txn, "outputs") {
        Some(Out::YArray(outputs)) => outputs,
        _ => cell.insert(txn, "outputs", ArrayPrelim::default()),
    }
}

fn find_cell<T: ReadTxn>(txn: &T, cells: &ArrayRef, id: &CellId) -> Option<MapRef> {
    cells.iter(txn).find_map(|item| match item {
        Out::YMap(map) => match map.get(txn, "id") {
            Some(Out::Any(Any::String(cell_id))) if &*cell_id == id.as_str() => Some(map),
            _ => None,
        },
        _ => None,
    })
}

fn read_cells<T: ReadTxn>(txn: &T, cells: &ArrayRef) -> Vec<Cell> {
    cells
        .iter(txn)
        .enumerate()
        .filter_map(|(index, item)| match cell_from_json(any_to_json(&item.to_json(txn))) {
            Ok(cell) => Some(cell),
            Err(e) => {
                warn!("Skipping unreadable cell at index {}: {}", index, e);
                None
            }
        })
        .collect()
}

/// Build a cell from its JSON form, dropping outputs this crate cannot read.
fn cell_from_json(mut value: Value) -> Result<Cell> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::Protocol("cell is not a map".into()))?;
    if let Some(source) = object.get_mut("source") {
        join_lines(source);
    }
    let outputs = match object.remove("outputs") {
        Some(Value::Array(outputs)) => outputs,
        _ => Vec::new(),
    };

    let mut cell: Cell = serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("invalid cell: {e}")))?;
    for mut output in outputs {
        normalize_output(&mut output);
        match serde_json::from_value::<Output>(output) {
            Ok(output) => cell.outputs.push(output),
            Err(e) => debug!("Skipping unreadable output of cell {}: {}", cell.id, e),
        }
    }
    Ok(cell)
}

/// nbformat allows multiline strings as lists of lines.
fn join_lines(value: &mut Value) {
    if let Value::Array(lines) = value {
        let joined: String = lines.iter().filter_map(Value::as_str).collect();
        *value = Value::String(joined);
    }
}

fn normalize_output(output: &mut Value) {
    let Some(object) = output.as_object_mut() else {
        return;
    };
    if let Some(text) = object.get_mut("text") {
        join_lines(text);
    }
    if let Some(Value::Object(data)) = object.get_mut("data") {
        data.values_mut()
            .filter(|payload| payload.is_array())
            .for_each(join_lines);
    }
}

fn output_any(output: &Output) -> Result<Any> {
    Ok(json_to_any(&serde_json::to_value(output)?))
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => text(s),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(fields) => Any::Map(Arc::new(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect::<HashMap<_, _>>(),
        )),
    }
}

fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined | Any::Buffer(_) => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        // Integral floats come from JavaScript peers; nbformat counters are integers
        Any::Number(n) if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 => {
            Value::Number(Number::from(*n as i64))
        }
        Any::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Any::BigInt(i) => Value::Number(Number::from(*i)),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect::<Map<_, _>>(),
        ),
    }
}

/// Change events turning `old` into `new`, or `None` if surviving cells
/// changed order.
fn diff_cells(old: &[Cell], new: &[Cell]) -> Option<Vec<DocumentEvent>> {
    let old_ids: HashSet<&CellId> = old.iter().map(|cell| &cell.id).collect();
    let new_ids: HashSet<&CellId> = new.iter().map(|cell| &cell.id).collect();

    let kept_old = old.iter().filter(|cell| new_ids.contains(&cell.id));
    let kept_new = new.iter().filter(|cell| old_ids.contains(&cell.id));
    if !kept_old.map(|cell| &cell.id).eq(kept_new.map(|cell| &cell.id)) {
        return None;
    }

    let mut events: Vec<DocumentEvent> = old
        .iter()
        .filter(|cell| !new_ids.contains(&cell.id))
        .map(|cell| DocumentEvent::CellDeleted {
            cell_id: cell.id.clone(),
        })
        .collect();
    for (index, cell) in new.iter().enumerate() {
        if !old_ids.contains(&cell.id) {
            events.push(DocumentEvent::CellInserted {
                index,
                cell: cell.clone(),
            });
        }
    }
    let previous: HashMap<&CellId, &Cell> = old.iter().map(|cell| (&cell.id, cell)).collect();
    for cell in new {
        if matches!(previous.get(&cell.id), Some(before) if *before != cell) {
            events.push(DocumentEvent::CellUpdated { cell: cell.clone() });
        }
    }
    Some(events)
}
