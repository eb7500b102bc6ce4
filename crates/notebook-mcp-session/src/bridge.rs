//! Execution bridge: one blocking unit of work per call.
//!
//! A call appends a cell, runs its code on the kernel, mirrors the outputs
//! into the document and returns the aggregated result before its deadline.
//! One call runs at a time; a concurrent call is rejected with `Busy`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notebook_mcp_core::protocol::CellUpdate;
use notebook_mcp_core::{CellId, ConnectionState, Error, Output, Result, SessionConfig};
use notebook_mcp_transport::{Connector, DocumentTarget, KernelTarget};

use crate::document::DocumentClient;
use crate::execution::{ExecutionResult, ExecutionSession, NotebookContent};
use crate::kernel::{ExecutionEvent, KernelClient};

struct Clients {
    document: DocumentClient,
    kernel: KernelClient,
}

/// Releases the single-flight flag on drop.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Orchestrates the document and kernel clients.
pub struct ExecutionBridge {
    config: SessionConfig,
    document_target: DocumentTarget,
    kernel_target: KernelTarget,
    in_flight: AtomicBool,
    clients: Mutex<Clients>,
}

impl ExecutionBridge {
    /// Create a bridge with a fresh kernel session id.
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self::with_session_id(connector, config, Uuid::new_v4().to_string())
    }

    /// Create a bridge identifying itself to the kernel as `session_id`.
    pub fn with_session_id(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        session_id: impl Into<String>,
    ) -> Self {
        let clients = Clients {
            document: DocumentClient::new(connector.clone(), &config),
            kernel: KernelClient::new(connector, &config, session_id),
        };
        Self {
            document_target: DocumentTarget::from(&config),
            kernel_target: KernelTarget::from(&config),
            config,
            in_flight: AtomicBool::new(false),
            clients: Mutex::new(clients),
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a call is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| FlightGuard(&self.in_flight))
            .map_err(|_| {
                debug!("Rejecting call: another execution is in flight");
                Error::Busy
            })
    }

    /// Connection states of the document and kernel clients.
    pub async fn connection_states(&self) -> (ConnectionState, ConnectionState) {
        let clients = self.clients.lock().await;
        (clients.document.state(), clients.kernel.state())
    }

    /// Connect both clients (startup warm-up).
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.acquire()?;
        let mut clients = self.clients.lock().await;
        let Clients { document, kernel } = &mut *clients;
        self.ensure_document(document).await?;
        self.ensure_kernel(kernel).await?;
        Ok(())
    }

    /// Append a code cell, execute it and return the collected outputs.
    ///
    /// At the deadline the execution is interrupted and a partial result with
    /// `incomplete = true` is returned.
    pub async fn run_code(&self, code: &str, timeout: Option<Duration>) -> Result<ExecutionResult> {
        let _guard = self.acquire()?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if timeout.is_zero() {
            return Err(Error::InvalidInput("timeout must be greater than zero".into()));
        }

        let mut clients = self.clients.lock().await;
        let Clients { document, kernel } = &mut *clients;
        self.ensure_document(document).await?;
        self.ensure_kernel(kernel).await?;

        let cell_id = document.append_code_cell(code).await?;
        let mut session = ExecutionSession::new(cell_id.clone(), timeout);
        let mut write_back = WriteBack::new(cell_id.clone());

        let reason = {
            let mut handle = match kernel.execute(code).await {
                Ok(handle) => handle,
                Err(e) => {
                    if e.is_connection_failure() {
                        document.mark_degraded();
                    }
                    return Err(e);
                }
            };
            session.set_msg_id(handle.msg_id());
            info!("Executing cell: id={}, msg_id={}", cell_id, handle.msg_id());

            loop {
                let event = match tokio::time::timeout_at(session.deadline(), handle.next()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => break None,
                    Err(_) => {
                        warn!("Execution timed out after {:?}: cell={}", timeout, cell_id);
                        if let Err(e) = handle.cancel().await {
                            warn!("Failed to interrupt execution: {}", e);
                        }
                        break Some(format!(
                            "execution did not finish within {}ms and was interrupted",
                            timeout.as_millis()
                        ));
                    }
                };
                match event {
                    Ok(ExecutionEvent::Output(output)) => {
                        if session.push(output.clone()) {
                            write_back.clear(document).await;
                        }
                        write_back.append(document, output).await;
                    }
                    Ok(ExecutionEvent::Display { display_id, output }) => {
                        if session.push_display(display_id, output.clone()) {
                            write_back.clear(document).await;
                        }
                        write_back.append(document, output).await;
                    }
                    Ok(ExecutionEvent::UpdateDisplay { display_id, output }) => {
                        if session.update_display(&display_id, output) {
                            let outputs = session.outputs().to_vec();
                            write_back
                                .update(document, CellUpdate::replace_outputs(outputs))
                                .await;
                        } else {
                            debug!("No display to update in this cell: display_id={}", display_id);
                        }
                    }
                    Ok(ExecutionEvent::ClearOutput { wait }) => {
                        if session.clear(wait) {
                            write_back.clear(document).await;
                        }
                    }
                    Ok(ExecutionEvent::Completed { execution_count }) => {
                        session.complete(execution_count);
                    }
                    Err(e) => {
                        warn!("Execution failed: cell={}, error={}", cell_id, e);
                        if e.is_connection_failure() {
                            document.mark_degraded();
                        }
                        return Err(e);
                    }
                }
            }
        };

        if let Some(count) = session.execution_count() {
            write_back
                .update(document, CellUpdate::execution_count(count))
                .await;
        }

        let result = session.finish(reason);
        info!(
            "Execution finished: cell={}, outputs={}, error={}, incomplete={}, elapsed_ms={}",
            result.cell_id,
            result.outputs.len(),
            result.error.is_some(),
            result.incomplete,
            result.elapsed_ms
        );
        Ok(result)
    }

    /// Append a markdown cell.
    pub async fn add_markdown(&self, source: &str) -> Result<CellId> {
        let _guard = self.acquire()?;
        let mut clients = self.clients.lock().await;
        self.ensure_document(&mut clients.document).await?;
        let id = clients.document.append_markdown_cell(source).await?;
        info!("Markdown cell added: id={}", id);
        Ok(id)
    }

    /// Current content of the document.
    pub async fn read_notebook(&self) -> Result<NotebookContent> {
        let _guard = self.acquire()?;
        let mut clients = self.clients.lock().await;
        self.ensure_document(&mut clients.document).await?;
        let cells = clients.document.cells().await?;
        Ok(NotebookContent::from_cells(&cells))
    }

    /// Restart the kernel.
    pub async fn restart_kernel(&self) -> Result<()> {
        let _guard = self.acquire()?;
        let mut clients = self.clients.lock().await;
        self.ensure_kernel(&mut clients.kernel).await?;
        clients.kernel.restart().await
    }

    /// Disconnect both clients and stop a kernel the bridge started.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.lock().await;
        clients.document.disconnect().await;
        clients.kernel.shutdown().await;
        info!("Bridge shut down");
    }

    async fn ensure_document(&self, document: &mut DocumentClient) -> Result<()> {
        if document.state() == ConnectionState::Connected {
            match document.refresh() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => debug!("Document channel lost: {}", e),
                Err(e) => return Err(e),
            }
        }
        match document.state() {
            ConnectionState::Degraded => {
                let mut backoff = self.config.reconnect_backoff;
                let mut attempt = 1;
                loop {
                    match document.reconnect().await {
                        Ok(_) => return Ok(()),
                        Err(e) if self.retryable(&e, attempt) => {
                            warn!(
                                "Document reconnect attempt {}/{} failed: {}",
                                attempt, self.config.reconnect_attempts, e
                            );
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                            attempt += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            _ => document.connect(&self.document_target).await.map(|_| ()),
        }
    }

    async fn ensure_kernel(&self, kernel: &mut KernelClient) -> Result<()> {
        if kernel.state() == ConnectionState::Connected {
            match kernel.refresh() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => debug!("Kernel channel lost: {}", e),
                Err(e) => return Err(e),
            }
        }
        match kernel.state() {
            ConnectionState::Degraded => {
                let mut backoff = self.config.reconnect_backoff;
                let mut attempt = 1;
                loop {
                    match kernel.reconnect().await {
                        Ok(_) => return Ok(()),
                        Err(e) if self.retryable(&e, attempt) => {
                            warn!(
                                "Kernel reconnect attempt {}/{} failed: {}",
                                attempt, self.config.reconnect_attempts, e
                            );
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                            attempt += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            _ => kernel.connect(&self.kernel_target).await.map(|_| ()),
        }
    }

    fn retryable(&self, error: &Error, attempt: u32) -> bool {
        error.is_connection_failure() && attempt < self.config.reconnect_attempts
    }
}

impl std::fmt::Debug for ExecutionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBridge")
            .field("notebook", &self.config.notebook_path)
            .field("in_flight", &self.is_busy())
            .finish()
    }
}

/// Best-effort mirroring of outputs into the document.
///
/// Failures are logged and swallowed; a stale cell stops further writes.
struct WriteBack {
    cell_id: CellId,
    enabled: bool,
}

impl WriteBack {
    fn new(cell_id: CellId) -> Self {
        Self {
            cell_id,
            enabled: true,
        }
    }

    async fn append(&mut self, document: &mut DocumentClient, output: Output) {
        if self.enabled {
            let result = document.append_output(&self.cell_id, output).await;
            self.settle(result);
        }
    }

    async fn clear(&mut self, document: &mut DocumentClient) {
        if self.enabled {
            let result = document
                .update_cell(&self.cell_id, CellUpdate::clear_outputs())
                .await;
            self.settle(result);
        }
    }

    async fn update(&mut self, document: &mut DocumentClient, update: CellUpdate) {
        if self.enabled {
            let result = document.update_cell(&self.cell_id, update).await;
            self.settle(result);
        }
    }

    fn settle(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(Error::StaleReference(id)) => {
                warn!("Cell deleted upstream, no longer writing outputs: id={}", id);
                self.enabled = false;
            }
            Err(e) => warn!("Failed to write output to cell {}: {}", self.cell_id, e),
        }
    }
}
