//! In-process fakes of the document store and the kernel.
//!
//! Both plug into [`MemoryConnector`](notebook_mcp_transport::MemoryConnector)
//! and speak the same wire messages as the real services, so the clients and
//! the bridge run unchanged against them.
//!
//! The fake kernel interprets a tiny script language, one statement per line
//! or `;`-separated:
//!
//! | Statement | Effect |
//! |-----------|--------|
//! | `print('text')` | stdout stream `text\n` |
//! | `raise Name('message')` | error output, ends the execution |
//! | `time.sleep(n)` | waits `n` seconds; interruptible |
//! | `display('text')` | display data with `text/plain` |
//! | `display('text', display_id='id')` | display data that can be updated |
//! | `update_display('text', display_id='id')` | update_display_data message |
//! | `clear_output()`, `clear_output(wait=True)` | clear_output message |
//! | `a + b`, `a - b`, `a * b`, `n` | integer value, reported if it is the last statement |
//! | `__disconnect__` | drops the connection |
//!
//! Any other statement is accepted and ignored. After an error, execute
//! requests already queued are aborted, as a real kernel does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use notebook_mcp_core::protocol::{
    DocumentEvent, DocumentRequest, KernelChannel, KernelMessage, NackReason,
    DOCUMENT_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use notebook_mcp_core::{Cell, CellId, Error, Result};
use notebook_mcp_transport::{
    memory_pair, DocumentEndpoint, DocumentTarget, KernelEndpoint, KernelTarget, MemoryChannel,
    MemoryReceiver, MemorySender,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_token(expected: &Option<String>, presented: &str) -> Result<()> {
    match expected {
        Some(token) if token != presented => Err(Error::Auth("invalid token".into())),
        _ => Ok(()),
    }
}

// =============================================================================
// Document store
// =============================================================================

#[derive(Debug, Default)]
struct StoreState {
    cells: Vec<Cell>,
    version: u64,
    deleted: bool,
    acks_suspended: bool,
    handshakes: usize,
    next_connection: u64,
    connections: HashMap<u64, MemorySender>,
}

impl StoreState {
    fn send(&mut self, connection: u64, event: DocumentEvent) {
        let Some(sender) = self.connections.get(&connection) else {
            return;
        };
        if let Ok(value) = event.to_value() {
            if sender.send(value).is_err() {
                self.connections.remove(&connection);
            }
        }
    }

    fn broadcast(&mut self, except: Option<u64>, event: DocumentEvent) {
        let targets: Vec<u64> = self
            .connections
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for connection in targets {
            self.send(connection, event.clone());
        }
    }

    fn position(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|cell| &cell.id == id)
    }

    fn reply(&mut self, connection: u64, request_id: String, outcome: Option<Option<usize>>) {
        if self.acks_suspended {
            debug!("Fake store withholding reply to {}", request_id);
            return;
        }
        let event = match outcome {
            Some(index) => DocumentEvent::Ack { request_id, index },
            None => DocumentEvent::Nack {
                request_id,
                reason: NackReason::CellNotFound,
            },
        };
        self.send(connection, event);
    }
}

/// Fake collaborative document store holding one notebook.
#[derive(Debug, Clone)]
pub struct FakeDocumentStore {
    path: String,
    token: Option<String>,
    protocol_version: u32,
    state: Arc<Mutex<StoreState>>,
}

impl FakeDocumentStore {
    /// Store serving an empty notebook at `path`, accepting any token.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: None,
            protocol_version: DOCUMENT_PROTOCOL_VERSION,
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    /// Require `token` on connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Advertise a different protocol version in snapshots.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Current authoritative cells.
    pub fn cells(&self) -> Vec<Cell> {
        lock(&self.state).cells.clone()
    }

    /// Number of `sync_request` handshakes served.
    pub fn handshakes(&self) -> usize {
        lock(&self.state).handshakes
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Append a cell as another collaborator would.
    pub fn external_insert(&self, cell: Cell) {
        let mut state = lock(&self.state);
        state.cells.push(cell.clone());
        state.version += 1;
        let index = state.cells.len() - 1;
        state.broadcast(None, DocumentEvent::CellInserted { index, cell });
    }

    /// Delete a cell as another collaborator would.
    pub fn external_delete(&self, id: &CellId) {
        let mut state = lock(&self.state);
        if let Some(index) = state.position(id) {
            state.cells.remove(index);
            state.version += 1;
            state.broadcast(None, DocumentEvent::CellDeleted { cell_id: id.clone() });
        }
    }

    /// Delete the whole document. Later connects fail with `NotFound`.
    pub fn delete_document(&self) {
        let mut state = lock(&self.state);
        state.deleted = true;
        state.cells.clear();
        state.broadcast(None, DocumentEvent::DocumentDeleted);
    }

    /// Recreate a deleted document, empty.
    pub fn recreate_document(&self) {
        let mut state = lock(&self.state);
        state.deleted = false;
        state.cells.clear();
        state.version += 1;
    }

    /// Drop every open connection, as a network failure would.
    pub fn drop_connections(&self) {
        lock(&self.state).connections.clear();
    }

    /// Apply writes but stop acknowledging them.
    pub fn suspend_acks(&self, suspended: bool) {
        lock(&self.state).acks_suspended = suspended;
    }

    fn serve(state: &Mutex<StoreState>, protocol_version: u32, connection: u64, value: Value) -> bool {
        let mut state = lock(state);
        if !state.connections.contains_key(&connection) {
            return false;
        }
        let request = match DocumentRequest::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                state.send(
                    connection,
                    DocumentEvent::Error {
                        code: "bad_request".into(),
                        message: e.to_string(),
                    },
                );
                return true;
            }
        };

        match request {
            DocumentRequest::SyncRequest { .. } => {
                state.handshakes += 1;
                let snapshot = DocumentEvent::Snapshot {
                    protocol_version,
                    version: state.version,
                    cells: state.cells.clone(),
                };
                state.send(connection, snapshot);
            }
            DocumentRequest::InsertCell { request_id, cell } => {
                state.cells.push(cell.clone());
                state.version += 1;
                let index = state.cells.len() - 1;
                state.reply(connection, request_id, Some(Some(index)));
                state.broadcast(Some(connection), DocumentEvent::CellInserted { index, cell });
            }
            DocumentRequest::AppendOutput {
                request_id,
                cell_id,
                output,
            } => match state.position(&cell_id) {
                Some(index) => {
                    state.cells[index].outputs.push(output.clone());
                    state.version += 1;
                    state.reply(connection, request_id, Some(None));
                    state.broadcast(
                        Some(connection),
                        DocumentEvent::OutputAppended { cell_id, output },
                    );
                }
                None => state.reply(connection, request_id, None),
            },
            DocumentRequest::UpdateCell {
                request_id,
                cell_id,
                update,
            } => match state.position(&cell_id) {
                Some(index) => {
                    update.apply(&mut state.cells[index]);
                    state.version += 1;
                    let cell = state.cells[index].clone();
                    state.reply(connection, request_id, Some(None));
                    state.broadcast(Some(connection), DocumentEvent::CellUpdated { cell });
                }
                None => state.reply(connection, request_id, None),
            },
        }
        true
    }
}

impl DocumentEndpoint for FakeDocumentStore {
    fn accept(&self, target: &DocumentTarget) -> Result<MemoryChannel> {
        check_token(&self.token, &target.token)?;
        let (client, server) = memory_pair();
        let (sender, mut receiver) = server.split();
        let sender = sender.ok_or(Error::NotConnected)?;

        let connection = {
            let mut state = lock(&self.state);
            if state.deleted || target.path != self.path {
                return Err(Error::NotFound(format!("notebook '{}'", target.path)));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(id, sender);
            id
        };

        let state = self.state.clone();
        let protocol_version = self.protocol_version;
        tokio::spawn(async move {
            while let Some(value) = receiver.recv().await {
                if !Self::serve(&state, protocol_version, connection, value) {
                    break;
                }
            }
            lock(&state).connections.remove(&connection);
        });
        Ok(client)
    }
}

// =============================================================================
// Kernel
// =============================================================================

lazy_static! {
    static ref PRINT: Regex = Regex::new(r#"^print\(\s*(?:'([^']*)'|"([^"]*)")\s*\)$"#)
        .expect("print pattern");
    static ref RAISE: Regex =
        Regex::new(r#"^raise\s+(\w+)(?:\(\s*(?:'([^']*)'|"([^"]*)")?\s*\))?$"#)
            .expect("raise pattern");
    static ref SLEEP: Regex =
        Regex::new(r"^(?:time\.)?sleep\(\s*(\d+(?:\.\d+)?)\s*\)$").expect("sleep pattern");
    static ref DISPLAY: Regex = Regex::new(
        r#"^display\(\s*(?:'([^']*)'|"([^"]*)")\s*(?:,\s*display_id\s*=\s*(?:'([^']*)'|"([^"]*)")\s*)?\)$"#
    )
    .expect("display pattern");
    static ref UPDATE_DISPLAY: Regex = Regex::new(
        r#"^update_display\(\s*(?:'([^']*)'|"([^"]*)")\s*,\s*display_id\s*=\s*(?:'([^']*)'|"([^"]*)")\s*\)$"#
    )
    .expect("update_display pattern");
    static ref CLEAR: Regex =
        Regex::new(r"^clear_output\(\s*(?:wait\s*=\s*(True|False))?\s*\)$").expect("clear pattern");
    static ref ARITHMETIC: Regex =
        Regex::new(r"^(-?\d+)\s*(?:([-+*])\s*(-?\d+))?$").expect("arithmetic pattern");
}

/// One interpreted statement.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Print(String),
    Raise { ename: String, evalue: String },
    Sleep(Duration),
    Display { text: String, display_id: Option<String> },
    UpdateDisplay { text: String, display_id: String },
    Clear { wait: bool },
    Value(String),
    Disconnect,
}

fn quoted(captures: &regex::Captures<'_>, first: usize) -> String {
    captures
        .get(first)
        .or_else(|| captures.get(first + 1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn evaluate(captures: &regex::Captures<'_>) -> Option<i64> {
    let lhs: i64 = captures.get(1)?.as_str().parse().ok()?;
    let Some(op) = captures.get(2) else {
        return Some(lhs);
    };
    let rhs: i64 = captures.get(3)?.as_str().parse().ok()?;
    match op.as_str() {
        "+" => lhs.checked_add(rhs),
        "-" => lhs.checked_sub(rhs),
        "*" => lhs.checked_mul(rhs),
        _ => None,
    }
}

/// Split a line at semicolons outside string literals.
fn statements(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, ';') => {
                parts.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

fn parse_script(code: &str) -> Vec<Step> {
    let lines: Vec<&str> = code
        .lines()
        .flat_map(statements)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    let last = lines.len().saturating_sub(1);

    lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            if *line == "__disconnect__" {
                Some(Step::Disconnect)
            } else if let Some(c) = PRINT.captures(line) {
                Some(Step::Print(quoted(&c, 1)))
            } else if let Some(c) = RAISE.captures(line) {
                Some(Step::Raise {
                    ename: c[1].to_string(),
                    evalue: quoted(&c, 2),
                })
            } else if let Some(c) = SLEEP.captures(line) {
                let secs: f64 = c[1].parse().ok()?;
                Some(Step::Sleep(Duration::from_secs_f64(secs)))
            } else if let Some(c) = DISPLAY.captures(line) {
                Some(Step::Display {
                    text: quoted(&c, 1),
                    display_id: c.get(3).or_else(|| c.get(4)).map(|m| m.as_str().to_string()),
                })
            } else if let Some(c) = UPDATE_DISPLAY.captures(line) {
                Some(Step::UpdateDisplay {
                    text: quoted(&c, 1),
                    display_id: quoted(&c, 3),
                })
            } else if let Some(c) = CLEAR.captures(line) {
                Some(Step::Clear {
                    wait: c.get(1).map_or(false, |m| m.as_str() == "True"),
                })
            } else if let Some(c) = ARITHMETIC.captures(line) {
                (index == last)
                    .then(|| evaluate(&c))
                    .flatten()
                    .map(|value| Step::Value(value.to_string()))
            } else {
                None
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct KernelState {
    kernels: HashSet<String>,
    started: usize,
    handshakes: usize,
    interrupts: usize,
    restarts: usize,
    execution_count: u32,
    pending_aborts: usize,
    next_connection: u64,
    connections: HashMap<u64, MemorySender>,
}

/// How a script run ended.
enum Ran {
    Finished,
    Interrupted,
    Disconnected,
}

/// Fake kernel manager plus kernel.
#[derive(Debug, Clone)]
pub struct FakeKernel {
    token: Option<String>,
    protocol_version: String,
    state: Arc<Mutex<KernelState>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// Kernel speaking the current protocol, accepting any token.
    pub fn new() -> Self {
        Self {
            token: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            state: Arc::new(Mutex::new(KernelState::default())),
        }
    }

    /// Require `token` on resolve and connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Advertise `version` in `kernel_info_reply`.
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Register a running kernel with a known id.
    pub fn with_kernel(self, id: impl Into<String>) -> Self {
        lock(&self.state).kernels.insert(id.into());
        self
    }

    /// Number of `kernel_info_request` handshakes served.
    pub fn handshakes(&self) -> usize {
        lock(&self.state).handshakes
    }

    /// Number of kernels started through resolve.
    pub fn kernels_started(&self) -> usize {
        lock(&self.state).started
    }

    /// Number of kernels currently running.
    pub fn kernels_running(&self) -> usize {
        lock(&self.state).kernels.len()
    }

    /// Abort the next execute request instead of running it.
    pub fn abort_next_execution(&self) {
        lock(&self.state).pending_aborts += 1;
    }

    /// Number of interrupt requests received.
    pub fn interrupts(&self) -> usize {
        lock(&self.state).interrupts
    }

    /// Number of restarts performed.
    pub fn restarts(&self) -> usize {
        lock(&self.state).restarts
    }

    /// Drop every open connection.
    pub fn drop_connections(&self) {
        lock(&self.state).connections.clear();
    }

    fn emit(state: &Mutex<KernelState>, connection: u64, message: KernelMessage) -> bool {
        let state = lock(state);
        let Some(sender) = state.connections.get(&connection) else {
            return false;
        };
        match message.to_value() {
            Ok(value) => sender.send(value).is_ok(),
            Err(_) => true,
        }
    }

    async fn serve(
        state: Arc<Mutex<KernelState>>,
        protocol_version: String,
        connection: u64,
        mut receiver: MemoryReceiver,
    ) {
        let mut backlog: VecDeque<KernelMessage> = VecDeque::new();
        loop {
            let request = match backlog.pop_front() {
                Some(request) => request,
                None => match receiver.recv().await {
                    Some(value) => match KernelMessage::from_value(value) {
                        Ok(request) => request,
                        Err(_) => continue,
                    },
                    None => break,
                },
            };

            let alive = match request.msg_type() {
                "kernel_info_request" => {
                    lock(&state).handshakes += 1;
                    let reply = KernelMessage::reply_to(
                        &request,
                        KernelChannel::Shell,
                        "kernel_info_reply",
                        json!({
                            "status": "ok",
                            "protocol_version": protocol_version,
                            "implementation": "fake",
                            "language_info": { "name": "python" },
                        }),
                    );
                    Self::emit(&state, connection, reply)
                }
                "execute_request" => {
                    let abort = {
                        let mut state = lock(&state);
                        let abort = state.pending_aborts > 0;
                        state.pending_aborts = state.pending_aborts.saturating_sub(1);
                        abort
                    };
                    if abort {
                        Self::abort(&state, connection, &request)
                    } else {
                        let ran =
                            Self::execute(&state, connection, &request, &mut receiver, &mut backlog)
                                .await;
                        !matches!(ran, Ran::Disconnected)
                    }
                }
                "interrupt_request" => {
                    lock(&state).interrupts += 1;
                    Self::interrupt_reply(&state, connection, &request)
                }
                "shutdown_request" => {
                    let restart = request
                        .content
                        .get("restart")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    {
                        let mut state = lock(&state);
                        state.execution_count = 0;
                        if restart {
                            state.restarts += 1;
                        }
                    }
                    let reply = KernelMessage::reply_to(
                        &request,
                        KernelChannel::Control,
                        "shutdown_reply",
                        json!({ "status": "ok", "restart": restart }),
                    );
                    Self::emit(&state, connection, reply)
                }
                other => {
                    debug!("Fake kernel ignoring {}", other);
                    true
                }
            };
            if !alive {
                break;
            }
        }
        lock(&state).connections.remove(&connection);
    }

    fn interrupt_reply(state: &Mutex<KernelState>, connection: u64, request: &KernelMessage) -> bool {
        let reply = KernelMessage::reply_to(
            request,
            KernelChannel::Control,
            "interrupt_reply",
            json!({ "status": "ok" }),
        );
        Self::emit(state, connection, reply)
    }

    /// Refuse an execute request the way a kernel does after an error.
    fn abort(state: &Mutex<KernelState>, connection: u64, request: &KernelMessage) -> bool {
        debug!("Fake kernel aborting execution: msg_id={}", request.msg_id());
        let iopub = |msg_type: &str, content: Value| {
            KernelMessage::reply_to(request, KernelChannel::IoPub, msg_type, content)
        };
        Self::emit(state, connection, iopub("status", json!({ "execution_state": "busy" })));
        let reply = KernelMessage::reply_to(
            request,
            KernelChannel::Shell,
            "execute_reply",
            json!({ "status": "aborted" }),
        );
        Self::emit(state, connection, reply);
        Self::emit(state, connection, iopub("status", json!({ "execution_state": "idle" })))
    }

    /// Abort execute requests queued behind a failed one; keep the rest.
    fn abort_queued(
        state: &Mutex<KernelState>,
        connection: u64,
        receiver: &mut MemoryReceiver,
        backlog: &mut VecDeque<KernelMessage>,
    ) {
        while let Some(Some(value)) = receiver.recv().now_or_never() {
            if let Ok(message) = KernelMessage::from_value(value) {
                backlog.push_back(message);
            }
        }
        for message in std::mem::take(backlog) {
            if message.msg_type() == "execute_request" {
                Self::abort(state, connection, &message);
            } else {
                backlog.push_back(message);
            }
        }
    }

    async fn execute(
        state: &Mutex<KernelState>,
        connection: u64,
        request: &KernelMessage,
        receiver: &mut MemoryReceiver,
        backlog: &mut VecDeque<KernelMessage>,
    ) -> Ran {
        let code = request
            .content
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let count = {
            let mut state = lock(state);
            state.execution_count += 1;
            state.execution_count
        };
        let iopub = |msg_type: &str, content: Value| {
            KernelMessage::reply_to(request, KernelChannel::IoPub, msg_type, content)
        };

        Self::emit(state, connection, iopub("status", json!({ "execution_state": "busy" })));
        Self::emit(
            state,
            connection,
            iopub("execute_input", json!({ "code": code, "execution_count": count })),
        );

        let mut ran = Ran::Finished;
        let mut failed = None;
        for step in parse_script(&code) {
            let message = match step {
                Step::Print(text) => {
                    iopub("stream", json!({ "name": "stdout", "text": format!("{text}\n") }))
                }
                Step::Display { text, display_id } => {
                    let mut content = json!({ "data": { "text/plain": text }, "metadata": {} });
                    if let Some(display_id) = display_id {
                        content["transient"] = json!({ "display_id": display_id });
                    }
                    iopub("display_data", content)
                }
                Step::UpdateDisplay { text, display_id } => iopub(
                    "update_display_data",
                    json!({
                        "data": { "text/plain": text },
                        "metadata": {},
                        "transient": { "display_id": display_id },
                    }),
                ),
                Step::Clear { wait } => iopub("clear_output", json!({ "wait": wait })),
                Step::Value(text) => iopub(
                    "execute_result",
                    json!({
                        "execution_count": count,
                        "data": { "text/plain": text },
                        "metadata": {},
                    }),
                ),
                Step::Raise { ename, evalue } => {
                    failed = Some((ename, evalue));
                    break;
                }
                Step::Disconnect => {
                    lock(state).connections.remove(&connection);
                    return Ran::Disconnected;
                }
                Step::Sleep(duration) => {
                    match Self::sleep(state, connection, duration, receiver, backlog).await {
                        Ran::Finished => continue,
                        Ran::Interrupted => {
                            ran = Ran::Interrupted;
                            failed = Some(("KeyboardInterrupt".to_string(), String::new()));
                            break;
                        }
                        Ran::Disconnected => return Ran::Disconnected,
                    }
                }
            };
            if !Self::emit(state, connection, message) {
                return Ran::Disconnected;
            }
        }

        let failed_run = failed.is_some();
        let status = match failed {
            Some((ename, evalue)) => {
                let traceback = vec![format!("\u{1b}[0;31m{ename}\u{1b}[0m: {evalue}")];
                Self::emit(
                    state,
                    connection,
                    iopub(
                        "error",
                        json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
                    ),
                );
                "error"
            }
            None => "ok",
        };
        let reply = KernelMessage::reply_to(
            request,
            KernelChannel::Shell,
            "execute_reply",
            json!({ "status": status, "execution_count": count }),
        );
        Self::emit(state, connection, reply);
        if failed_run {
            Self::abort_queued(state, connection, receiver, backlog);
        }
        if !Self::emit(state, connection, iopub("status", json!({ "execution_state": "idle" }))) {
            return Ran::Disconnected;
        }
        ran
    }

    /// Sleep, watching the channel for an interrupt. Other requests are queued.
    async fn sleep(
        state: &Mutex<KernelState>,
        connection: u64,
        duration: Duration,
        receiver: &mut MemoryReceiver,
        backlog: &mut VecDeque<KernelMessage>,
    ) -> Ran {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ran::Finished,
                incoming = receiver.recv() => {
                    let Some(value) = incoming else {
                        return Ran::Disconnected;
                    };
                    let Ok(message) = KernelMessage::from_value(value) else {
                        continue;
                    };
                    if message.msg_type() == "interrupt_request" {
                        lock(state).interrupts += 1;
                        Self::interrupt_reply(state, connection, &message);
                        return Ran::Interrupted;
                    }
                    backlog.push_back(message);
                }
            }
        }
    }
}

impl KernelEndpoint for FakeKernel {
    fn resolve(&self, target: &KernelTarget) -> Result<String> {
        check_token(&self.token, &target.token)?;
        let mut state = lock(&self.state);
        match &target.kernel_id {
            Some(id) if state.kernels.contains(id) => Ok(id.clone()),
            Some(id) => Err(Error::NotFound(format!("kernel '{id}'"))),
            None => {
                state.started += 1;
                let id = format!("fake-kernel-{}", state.started);
                state.kernels.insert(id.clone());
                debug!("Fake kernel started: id={}, name={}", id, target.kernel_name);
                Ok(id)
            }
        }
    }

    fn accept(&self, target: &KernelTarget, kernel_id: &str) -> Result<MemoryChannel> {
        check_token(&self.token, &target.token)?;
        let (client, server) = memory_pair();
        let (sender, receiver) = server.split();
        let sender = sender.ok_or(Error::NotConnected)?;

        let connection = {
            let mut state = lock(&self.state);
            if !state.kernels.contains(kernel_id) {
                return Err(Error::NotFound(format!("kernel '{kernel_id}'")));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(id, sender);
            id
        };

        tokio::spawn(Self::serve(
            self.state.clone(),
            self.protocol_version.clone(),
            connection,
            receiver,
        ));
        Ok(client)
    }

    fn shutdown(&self, target: &KernelTarget, kernel_id: &str) -> Result<()> {
        check_token(&self.token, &target.token)?;
        if !lock(&self.state).kernels.remove(kernel_id) {
            return Err(Error::NotFound(format!("kernel '{kernel_id}'")));
        }
        debug!("Fake kernel stopped: id={}", kernel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let steps = parse_script("import time\nprint('a')\ntime.sleep(2)\n1 + 2");
        assert_eq!(
            steps,
            vec![
                Step::Print("a".into()),
                Step::Sleep(Duration::from_secs(2)),
                Step::Value("3".into()),
            ]
        );
    }

    #[test]
    fn test_value_only_on_last_line() {
        assert_eq!(parse_script("1+1\nprint('x')"), vec![Step::Print("x".into())]);
        assert_eq!(parse_script("6 * 7"), vec![Step::Value("42".into())]);
    }

    #[test]
    fn test_parse_raise() {
        assert_eq!(
            parse_script("raise ValueError('bad input')"),
            vec![Step::Raise {
                ename: "ValueError".into(),
                evalue: "bad input".into()
            }]
        );
        assert_eq!(
            parse_script("raise StopIteration"),
            vec![Step::Raise {
                ename: "StopIteration".into(),
                evalue: String::new()
            }]
        );
    }

    #[test]
    fn test_parse_clear_and_display() {
        assert_eq!(
            parse_script("display(\"x\")\nclear_output(wait=True)\nclear_output()"),
            vec![
                Step::Display {
                    text: "x".into(),
                    display_id: None
                },
                Step::Clear { wait: true },
                Step::Clear { wait: false },
            ]
        );
        assert_eq!(
            parse_script("display('0%', display_id='p')\nupdate_display(\"9%\", display_id=\"p\")"),
            vec![
                Step::Display {
                    text: "0%".into(),
                    display_id: Some("p".into())
                },
                Step::UpdateDisplay {
                    text: "9%".into(),
                    display_id: "p".into()
                },
            ]
        );
    }

    #[test]
    fn test_semicolons_separate_statements() {
        assert_eq!(
            parse_script("import time; time.sleep(10)"),
            vec![Step::Sleep(Duration::from_secs(10))]
        );
        assert_eq!(
            parse_script("print('a; b'); 2 * 3"),
            vec![Step::Print("a; b".into()), Step::Value("6".into())]
        );
    }

    #[test]
    fn test_token_check() {
        assert!(check_token(&None, "").is_ok());
        assert!(check_token(&Some("t".into()), "t").is_ok());
        assert!(matches!(
            check_token(&Some("t".into()), "wrong"),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_resolve_starts_then_reuses() {
        let kernel = FakeKernel::new();
        let mut target = KernelTarget {
            server_url: url::Url::parse("http://localhost:8888").unwrap(),
            kernel_id: None,
            kernel_name: "python3".into(),
            token: String::new(),
        };
        let id = kernel.resolve(&target).unwrap();
        assert_eq!(kernel.kernels_started(), 1);

        target.kernel_id = Some(id.clone());
        assert_eq!(kernel.resolve(&target).unwrap(), id);
        assert_eq!(kernel.kernels_started(), 1);

        target.kernel_id = Some("missing".into());
        assert!(matches!(kernel.resolve(&target), Err(Error::NotFound(_))));

        assert!(kernel.shutdown(&target, &id).is_ok());
        assert_eq!(kernel.kernels_running(), 0);
        assert!(matches!(kernel.shutdown(&target, &id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_document_accept_checks_path() {
        let store = FakeDocumentStore::new("a.ipynb");
        let target = DocumentTarget {
            server_url: url::Url::parse("http://localhost:8888").unwrap(),
            path: "b.ipynb".into(),
            token: String::new(),
        };
        assert!(matches!(store.accept(&target), Err(Error::NotFound(_))));
    }
}
