//! Client for the collaborative notebook document.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use notebook_mcp_core::protocol::{
    CellUpdate, DocumentEvent, DocumentRequest, NackReason, DOCUMENT_PROTOCOL_VERSION,
};
use notebook_mcp_core::{
    Cell, CellId, ConnectionHandle, ConnectionState, Error, Output, Result, SessionConfig,
};
use notebook_mcp_transport::{Channel, Connector, DocumentTarget};

use crate::mirror::{MirrorEffect, NotebookMirror};

/// Live connection to one notebook document plus its local mirror.
///
/// Upstream changes are applied only while the client is polled: before
/// every operation and while waiting for an acknowledgement.
pub struct DocumentClient {
    connector: Arc<dyn Connector>,
    ack_timeout: Duration,
    connect_timeout: Duration,
    target: Option<DocumentTarget>,
    channel: Option<Box<dyn Channel>>,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    mirror: NotebookMirror,
    owned: HashSet<CellId>,
    next_request: u64,
}

enum Reply {
    Ack(Option<usize>),
    Nack(NackReason),
}

impl DocumentClient {
    /// Create a disconnected client.
    pub fn new(connector: Arc<dyn Connector>, config: &SessionConfig) -> Self {
        Self {
            connector,
            ack_timeout: config.ack_timeout,
            connect_timeout: config.connect_timeout,
            target: None,
            channel: None,
            state: ConnectionState::Disconnected,
            handle: None,
            mirror: NotebookMirror::new(),
            owned: HashSet::new(),
            next_request: 0,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle of the current connection.
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Whether this client created the cell.
    pub fn owns(&self, id: &CellId) -> bool {
        self.owned.contains(id)
    }

    /// Connect to a document and install its snapshot.
    ///
    /// Connecting again to the same target while connected returns the
    /// existing handle without a new handshake. A different target drops the
    /// current mirror and ownership.
    pub async fn connect(&mut self, target: &DocumentTarget) -> Result<ConnectionHandle> {
        if self.target.as_ref() == Some(target) {
            if let (ConnectionState::Connected, Some(handle)) = (self.state, &self.handle) {
                debug!("Document already connected: path={}", target.path);
                return Ok(handle.clone());
            }
        } else if self.target.is_some() {
            info!("Switching document: path={}", target.path);
            self.disconnect().await;
            self.mirror = NotebookMirror::new();
            self.owned.clear();
        }
        self.target = Some(target.clone());

        let previous = self.state;
        self.transition(ConnectionState::Connecting);
        match self.handshake(target).await {
            Ok(handle) => {
                self.handle = Some(handle.clone());
                self.transition(ConnectionState::Connected);
                Ok(handle)
            }
            Err(e) => {
                warn!("Document connect failed: path={}, error={}", target.path, e);
                self.drop_channel().await;
                let fallback = if previous == ConnectionState::Degraded {
                    ConnectionState::Degraded
                } else {
                    ConnectionState::Disconnected
                };
                self.transition(fallback);
                Err(e)
            }
        }
    }

    /// Reconnect to the last target, resyncing the mirror.
    pub async fn reconnect(&mut self) -> Result<ConnectionHandle> {
        let target = self.target.clone().ok_or(Error::NotConnected)?;
        self.drop_channel().await;
        self.handle = None;
        self.connect(&target).await
    }

    async fn handshake(&mut self, target: &DocumentTarget) -> Result<ConnectionHandle> {
        self.drop_channel().await;
        let deadline = Instant::now() + self.connect_timeout;

        let mut channel = tokio::time::timeout_at(deadline, self.connector.open_document(target))
            .await
            .map_err(|_| self.connect_timed_out(target))??;

        let request = DocumentRequest::SyncRequest {
            protocol_version: DOCUMENT_PROTOCOL_VERSION,
        };
        channel.send(request.to_value()?).await?;

        loop {
            let frame = tokio::time::timeout_at(deadline, channel.recv())
                .await
                .map_err(|_| self.connect_timed_out(target))?;
            let value = match frame {
                Some(value) => value?,
                None => {
                    return Err(Error::Unreachable(format!(
                        "document channel for '{}' closed during handshake",
                        target.path
                    )))
                }
            };
            match DocumentEvent::from_value(value)? {
                DocumentEvent::Snapshot {
                    protocol_version,
                    version,
                    cells,
                } => {
                    if protocol_version != DOCUMENT_PROTOCOL_VERSION {
                        return Err(Error::ProtocolMismatch(format!(
                            "document store speaks version {protocol_version}, expected {DOCUMENT_PROTOCOL_VERSION}"
                        )));
                    }
                    info!(
                        "Document synchronized: path={}, version={}, cells={}",
                        target.path,
                        version,
                        cells.len()
                    );
                    self.mirror.install_snapshot(version, cells);
                    self.channel = Some(channel);
                    return Ok(ConnectionHandle::new(target.path.clone()));
                }
                DocumentEvent::Error { code, message } => return Err(store_error(&code, message)),
                other => debug!("Ignoring event before snapshot: {:?}", other),
            }
        }
    }

    fn connect_timed_out(&self, target: &DocumentTarget) -> Error {
        Error::Unreachable(format!(
            "document '{}' did not synchronize within {}ms",
            target.path,
            self.connect_timeout.as_millis()
        ))
    }

    /// Release the channel. Later operations fail with `NotConnected`.
    pub async fn disconnect(&mut self) {
        self.drop_channel().await;
        self.handle = None;
        if self.state != ConnectionState::Disconnected {
            info!("Document disconnected");
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Move to `Degraded` and drop the channel; the next use must reconnect.
    pub fn mark_degraded(&mut self) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Connecting {
            warn!("Document connection degraded");
            self.transition(ConnectionState::Degraded);
        }
        self.channel = None;
        self.handle = None;
    }

    /// Append a code cell at the end of the document.
    pub async fn append_code_cell(&mut self, source: &str) -> Result<CellId> {
        self.append_cell(Cell::code(source)).await
    }

    /// Append a markdown cell at the end of the document.
    pub async fn append_markdown_cell(&mut self, source: &str) -> Result<CellId> {
        self.append_cell(Cell::markdown(source)).await
    }

    async fn append_cell(&mut self, cell: Cell) -> Result<CellId> {
        let id = cell.id.clone();
        let request_id = self.request_id();
        let reply = self
            .request(DocumentRequest::InsertCell {
                request_id,
                cell: cell.clone(),
            })
            .await?;
        match reply {
            Reply::Ack(index) => {
                self.mirror.insert(index, cell);
                self.owned.insert(id.clone());
                debug!("Cell appended: id={}, index={:?}", id, index);
                Ok(id)
            }
            Reply::Nack(reason) => Err(Error::Protocol(format!(
                "store refused cell insert: {reason:?}"
            ))),
        }
    }

    /// Current mirror state of a cell.
    pub async fn read_cell(&mut self, id: &CellId) -> Result<Cell> {
        self.poll()?;
        self.mirror.lookup(id).cloned()
    }

    /// The whole mirrored document in order.
    pub async fn cells(&mut self) -> Result<Vec<Cell>> {
        self.poll()?;
        Ok(self.mirror.cells().to_vec())
    }

    /// Append an output to a cell this client created.
    pub async fn append_output(&mut self, id: &CellId, output: Output) -> Result<()> {
        self.check_owned(id)?;
        let request_id = self.request_id();
        let reply = self
            .request(DocumentRequest::AppendOutput {
                request_id,
                cell_id: id.clone(),
                output: output.clone(),
            })
            .await?;
        self.settle(id, reply, |mirror| mirror.append_output(id, output))
    }

    /// Update execution state of a cell this client created.
    pub async fn update_cell(&mut self, id: &CellId, update: CellUpdate) -> Result<()> {
        self.check_owned(id)?;
        let request_id = self.request_id();
        let reply = self
            .request(DocumentRequest::UpdateCell {
                request_id,
                cell_id: id.clone(),
                update: update.clone(),
            })
            .await?;
        self.settle(id, reply, |mirror| mirror.update(id, &update))
    }

    fn settle<F>(&mut self, id: &CellId, reply: Reply, apply: F) -> Result<()>
    where
        F: FnOnce(&mut NotebookMirror) -> Result<()>,
    {
        match reply {
            Reply::Ack(_) => apply(&mut self.mirror),
            Reply::Nack(NackReason::CellNotFound) => {
                self.mirror.remove(id);
                Err(Error::StaleReference(id.clone()))
            }
            Reply::Nack(NackReason::Rejected) => Err(Error::Protocol(format!(
                "store rejected write to cell '{id}'"
            ))),
        }
    }

    fn check_owned(&mut self, id: &CellId) -> Result<()> {
        self.poll()?;
        if self.mirror.is_deleted(id) && self.mirror.get(id).is_none() {
            return Err(Error::StaleReference(id.clone()));
        }
        if !self.owned.contains(id) {
            return match self.mirror.get(id) {
                Some(_) => Err(Error::InvalidInput(format!(
                    "cell '{id}' was not created by this client"
                ))),
                None => Err(Error::NotFound(format!("cell '{id}'"))),
            };
        }
        Ok(())
    }

    fn request_id(&mut self) -> String {
        self.next_request += 1;
        format!("req-{}", self.next_request)
    }

    async fn request(&mut self, request: DocumentRequest) -> Result<Reply> {
        self.poll()?;
        let request_id = request
            .request_id()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidInput("request carries no request id".into()))?;

        let message = request.to_value()?;
        let sent = match self.channel.as_mut() {
            Some(channel) => channel.send(message).await,
            None => Err(Error::NotConnected),
        };
        if let Err(e) = sent {
            if e.is_connection_failure() {
                self.mark_degraded();
            }
            return Err(e);
        }

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let frame = match self.channel.as_mut() {
                Some(channel) => tokio::time::timeout_at(deadline, channel.recv()).await,
                None => return Err(Error::NotConnected),
            };
            let value = match frame {
                Err(_) => {
                    warn!("No acknowledgement for {} within {:?}", request_id, self.ack_timeout);
                    self.mark_degraded();
                    return Err(Error::Timeout(self.ack_timeout.as_millis() as u64));
                }
                Ok(None) => {
                    self.mark_degraded();
                    return Err(Error::NotConnected);
                }
                Ok(Some(Err(e))) => {
                    self.mark_degraded();
                    return Err(e);
                }
                Ok(Some(Ok(value))) => value,
            };

            let event = match DocumentEvent::from_value(value) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed document event: {}", e);
                    continue;
                }
            };
            match event {
                DocumentEvent::Ack {
                    request_id: ref acked,
                    index,
                } if *acked == request_id => return Ok(Reply::Ack(index)),
                DocumentEvent::Nack {
                    request_id: ref refused,
                    reason,
                } if *refused == request_id => return Ok(Reply::Nack(reason)),
                other => self.handle_event(other)?,
            }
        }
    }

    /// Apply upstream changes already received. Detects a lost channel.
    pub fn refresh(&mut self) -> Result<()> {
        self.poll()
    }

    /// Apply every event that is already waiting on the channel.
    fn poll(&mut self) -> Result<()> {
        if !self.state.can_mutate() {
            return Err(Error::NotConnected);
        }
        loop {
            let pending = match self.channel.as_mut() {
                Some(channel) => channel.recv().now_or_never(),
                None => return Err(Error::NotConnected),
            };
            match pending {
                None => return Ok(()),
                Some(None) => {
                    self.mark_degraded();
                    return Err(Error::NotConnected);
                }
                Some(Some(Err(e))) => {
                    self.mark_degraded();
                    return Err(e);
                }
                Some(Some(Ok(value))) => self.handle_value(value)?,
            }
        }
    }

    fn handle_value(&mut self, value: Value) -> Result<()> {
        match DocumentEvent::from_value(value) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                warn!("Skipping malformed document event: {}", e);
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: DocumentEvent) -> Result<()> {
        if let DocumentEvent::Error { code, message } = &event {
            warn!("Document store error: code={}, message={}", code, message);
            return Ok(());
        }
        match self.mirror.apply(event) {
            MirrorEffect::DocumentDeleted => {
                warn!("Document deleted upstream");
                self.mark_degraded();
                Err(Error::NotFound("document deleted upstream".into()))
            }
            MirrorEffect::Deleted(id) if self.owned.contains(&id) => {
                debug!("Owned cell deleted upstream: id={}", id);
                Ok(())
            }
            MirrorEffect::Ignored => Ok(()),
            effect => {
                debug!("Applied upstream change: {:?}", effect);
                Ok(())
            }
        }
    }

    async fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Document state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Map a store `error` event received during the handshake.
fn store_error(code: &str, message: String) -> Error {
    match code {
        "unauthorized" | "forbidden" => Error::Auth(message),
        "not_found" => Error::NotFound(message),
        "protocol_mismatch" => Error::ProtocolMismatch(message),
        _ => Error::Protocol(format!("{code}: {message}")),
    }
}

impl std::fmt::Debug for DocumentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentClient")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("cells", &self.mirror.len())
            .field("owned", &self.owned.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDocumentStore, FakeKernel};
    use notebook_mcp_core::ServerConfig;
    use notebook_mcp_transport::MemoryConnector;

    fn setup(store: &Arc<FakeDocumentStore>) -> (DocumentClient, DocumentTarget) {
        let config = ServerConfig::default().session_config().unwrap();
        let connector = MemoryConnector::new(store.clone(), Arc::new(FakeKernel::new()));
        let client = DocumentClient::new(Arc::new(connector), &config);
        (client, DocumentTarget::from(&config))
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, _) = setup(&store);
        assert!(matches!(
            client.append_code_cell("1").await,
            Err(Error::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_installs_snapshot() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        store.external_insert(Cell::markdown("# Existing"));
        let (mut client, target) = setup(&store);

        client.connect(&target).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        let cells = client.cells().await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].source, "# Existing");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);

        let first = client.connect(&target).await.unwrap();
        let second = client.connect(&target).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_connect_missing_document() {
        let store = Arc::new(FakeDocumentStore::new("other.ipynb"));
        let (mut client, target) = setup(&store);
        let err = client.connect(&target).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_append_and_read_cell() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        let id = client.append_code_cell("x = 1").await.unwrap();
        assert!(client.owns(&id));
        let cell = client.read_cell(&id).await.unwrap();
        assert_eq!(cell.source, "x = 1");
        assert_eq!(store.cells().len(), 1);
    }

    #[tokio::test]
    async fn test_append_output_and_update() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        let id = client.append_code_cell("print('a')").await.unwrap();
        client.append_output(&id, Output::stdout("a\n")).await.unwrap();
        client
            .update_cell(&id, CellUpdate::execution_count(3))
            .await
            .unwrap();

        let cell = client.read_cell(&id).await.unwrap();
        assert_eq!(cell.rendered_outputs(), vec!["a\n".to_string()]);
        assert_eq!(cell.execution_count, Some(3));
        assert_eq!(store.cells()[0].outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_insert_visible() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        store.external_insert(Cell::markdown("from a collaborator"));
        let cells = client.cells().await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].source, "from a collaborator");
    }

    #[tokio::test]
    async fn test_refuses_foreign_cell() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let foreign = Cell::code("theirs");
        let foreign_id = foreign.id.clone();
        store.external_insert(foreign);
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        let err = client
            .append_output(&foreign_id, Output::stdout("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_stale_reference_after_upstream_delete() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        let id = client.append_code_cell("1").await.unwrap();
        store.external_delete(&id);

        let err = client.append_output(&id, Output::stdout("x")).await.unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
        let err = client.read_cell(&id).await.unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
    }

    #[tokio::test]
    async fn test_disconnect_then_not_connected() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();
        client.disconnect().await;

        assert!(matches!(client.cells().await, Err(Error::NotConnected)));
        assert!(client.handle().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_keeps_ownership() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();
        let id = client.append_code_cell("1").await.unwrap();

        store.drop_connections();
        assert!(client.cells().await.is_err());
        assert_eq!(client.state(), ConnectionState::Degraded);

        client.reconnect().await.unwrap();
        assert_eq!(store.handshakes(), 2);
        client.append_output(&id, Output::stdout("after")).await.unwrap();
        assert_eq!(client.read_cell(&id).await.unwrap().outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_document_deleted_fails_fast() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();

        store.delete_document();
        let err = client.cells().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(client.state(), ConnectionState::Degraded);

        let err = client.reconnect().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recreated_document_resyncs() {
        let store = Arc::new(FakeDocumentStore::new("notebook.ipynb"));
        let (mut client, target) = setup(&store);
        client.connect(&target).await.unwrap();
        let old = client.append_code_cell("1").await.unwrap();

        store.delete_document();
        assert!(client.cells().await.is_err());
        store.recreate_document();
        client.reconnect().await.unwrap();

        assert!(client.cells().await.unwrap().is_empty());
        let err = client.read_cell(&old).await.unwrap_err();
        assert!(matches!(err, Error::StaleReference(id) if id == old));
        let fresh = client.append_code_cell("2").await.unwrap();
        assert_eq!(client.read_cell(&fresh).await.unwrap().source, "2");
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(store_error("unauthorized", "x".into()), Error::Auth(_)));
        assert!(matches!(store_error("not_found", "x".into()), Error::NotFound(_)));
        assert!(matches!(store_error("weird", "x".into()), Error::Protocol(_)));
    }
}
