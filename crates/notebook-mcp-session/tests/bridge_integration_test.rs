//! Integration tests for the execution bridge against the in-process fakes.

use std::sync::Arc;
use std::time::Duration;

use notebook_mcp_core::{Cell, ConnectionState, Error, ServerConfig};
use notebook_mcp_session::{ExecutionBridge, FakeDocumentStore, FakeKernel};
use notebook_mcp_transport::MemoryConnector;

struct Harness {
    bridge: Arc<ExecutionBridge>,
    store: Arc<FakeDocumentStore>,
    kernel: Arc<FakeKernel>,
}

fn harness_with(store: FakeDocumentStore, kernel: FakeKernel, token: &str) -> Harness {
    let store = Arc::new(store);
    let kernel = Arc::new(kernel);
    let mut config = ServerConfig::default();
    config.notebook.token = token.to_string();
    config.bridge.reconnect_backoff_ms = 10;
    let session = config.session_config().unwrap();
    let connector = MemoryConnector::new(store.clone(), kernel.clone());
    Harness {
        bridge: Arc::new(ExecutionBridge::new(Arc::new(connector), session)),
        store,
        kernel,
    }
}

fn harness() -> Harness {
    harness_with(
        FakeDocumentStore::new("notebook.ipynb"),
        FakeKernel::new(),
        "",
    )
}

#[tokio::test]
async fn test_simple_expression() {
    let h = harness();
    let result = h.bridge.run_code("1+1", None).await.unwrap();

    assert_eq!(result.text, "2");
    assert!(result.error.is_none());
    assert!(!result.incomplete);
    assert_eq!(h.store.cells().len(), 1);
    assert_eq!(h.store.cells()[0].source, "1+1");
}

#[tokio::test]
async fn test_exception_is_a_result() {
    let h = harness();
    let result = h
        .bridge
        .run_code("raise ValueError('x')", None)
        .await
        .unwrap();

    let error = result.error.expect("error reported");
    assert_eq!(error.kind, "ValueError");
    assert_eq!(error.message, "x");
    assert!(!result.incomplete);
    assert!(h.store.cells()[0].outputs[0].is_error());
}

#[tokio::test]
async fn test_timeout_interrupts_and_returns_partial() {
    let h = harness();
    let started = tokio::time::Instant::now();
    let result = h
        .bridge
        .run_code(
            "import time\nprint('working')\ntime.sleep(10)",
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert!(result.incomplete);
    assert!(result.reason.is_some());
    assert_eq!(result.text, "working\n");
    assert!(started.elapsed() < Duration::from_secs(3));

    // The kernel is still usable and the interrupt reached it
    let next = h.bridge.run_code("print('after')", None).await.unwrap();
    assert_eq!(next.text, "after\n");
    assert_eq!(h.kernel.interrupts(), 1);
}

#[tokio::test]
async fn test_invalid_token_appends_nothing() {
    let h = harness_with(
        FakeDocumentStore::new("notebook.ipynb").with_token("secret"),
        FakeKernel::new().with_token("secret"),
        "wrong",
    );
    let err = h.bridge.run_code("1+1", None).await.unwrap_err();

    assert!(matches!(err, Error::Auth(_)));
    assert!(h.store.cells().is_empty());
    assert_eq!(h.kernel.kernels_started(), 0);
}

#[tokio::test]
async fn test_valid_token_accepted() {
    let h = harness_with(
        FakeDocumentStore::new("notebook.ipynb").with_token("secret"),
        FakeKernel::new().with_token("secret"),
        "secret",
    );
    assert_eq!(h.bridge.run_code("2*3", None).await.unwrap().text, "6");
}

#[tokio::test]
async fn test_concurrent_call_rejected_busy() {
    let h = harness();
    let bridge = h.bridge.clone();
    let running = tokio::spawn(async move { bridge.run_code("time.sleep(1)\nprint('done')", None).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.bridge.is_busy());
    assert!(matches!(h.bridge.run_code("1", None).await, Err(Error::Busy)));
    assert!(matches!(h.bridge.add_markdown("x").await, Err(Error::Busy)));
    assert!(matches!(h.bridge.read_notebook().await, Err(Error::Busy)));

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.text, "done\n");
    assert!(!h.bridge.is_busy());
    assert_eq!(h.store.cells().len(), 1);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let h = harness();
    h.bridge.connect().await.unwrap();
    h.bridge.connect().await.unwrap();
    h.bridge.run_code("1", None).await.unwrap();

    assert_eq!(h.store.handshakes(), 1);
    assert_eq!(h.kernel.handshakes(), 1);
    assert_eq!(h.kernel.kernels_started(), 1);
}

#[tokio::test]
async fn test_outputs_keep_kernel_order() {
    let h = harness();
    let result = h
        .bridge
        .run_code("print('a')\ndisplay('b')\nprint('c')\n7", None)
        .await
        .unwrap();

    assert_eq!(result.outputs, vec!["a\n", "b", "c\n", "7"]);
    assert_eq!(result.text, "a\nc\n7");
    assert_eq!(result.displays.len(), 2);
    assert_eq!(h.store.cells()[0].rendered_outputs(), result.outputs);
}

#[tokio::test]
async fn test_cell_deleted_during_execution() {
    let h = harness();
    let bridge = h.bridge.clone();
    let running =
        tokio::spawn(async move { bridge.run_code("time.sleep(1)\nprint('late')", None).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let id = h.store.cells()[0].id.clone();
    h.store.external_delete(&id);

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.text, "late\n");
    assert_eq!(result.cell_id, id);
    assert!(h.store.cells().is_empty());
}

#[tokio::test]
async fn test_upstream_edits_visible() {
    let h = harness();
    h.store.external_insert(Cell::markdown("before"));
    h.bridge.run_code("1", None).await.unwrap();
    h.store.external_insert(Cell::markdown("after"));

    let content = h.bridge.read_notebook().await.unwrap();
    let sources: Vec<&str> = content.cells.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(sources, vec!["before", "1", "after"]);
    assert_eq!(content.total_cells, 3);
}

#[tokio::test]
async fn test_reconnects_after_dropped_document() {
    let h = harness();
    h.bridge.connect().await.unwrap();
    h.store.drop_connections();

    let result = h.bridge.run_code("1+1", None).await.unwrap();
    assert_eq!(result.text, "2");
    assert_eq!(h.store.handshakes(), 2);
}

#[tokio::test]
async fn test_kernel_loss_interrupts_execution() {
    let h = harness();
    let err = h
        .bridge
        .run_code("print('a')\n__disconnect__", None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ExecutionInterrupted(_)));
    assert_eq!(
        h.bridge.connection_states().await,
        (ConnectionState::Degraded, ConnectionState::Degraded)
    );

    // Next call reconnects both clients to the same kernel
    let result = h.bridge.run_code("1+1", None).await.unwrap();
    assert_eq!(result.text, "2");
    assert_eq!(h.kernel.kernels_started(), 1);
    assert_eq!(h.kernel.handshakes(), 2);
    assert_eq!(h.store.handshakes(), 2);
}

#[tokio::test]
async fn test_deleted_document_fails_fast() {
    let h = harness();
    h.bridge.connect().await.unwrap();
    h.store.delete_document();

    let err = h.bridge.run_code("1", None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.bridge.read_notebook().await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_recreated_document_used_after_recovery() {
    let h = harness();
    h.bridge.run_code("print('before')", None).await.unwrap();
    h.store.delete_document();
    let err = h.bridge.run_code("1", None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    h.store.recreate_document();
    let result = h.bridge.run_code("print('after')", None).await.unwrap();
    assert_eq!(result.text, "after\n");

    let content = h.bridge.read_notebook().await.unwrap();
    assert_eq!(content.total_cells, 1);
    assert_eq!(content.cells[0].id, result.cell_id);
    assert_eq!(h.store.cells().len(), 1);
}

#[tokio::test]
async fn test_configured_kernel_survives_shutdown() {
    let store = FakeDocumentStore::new("notebook.ipynb");
    let kernel = Arc::new(FakeKernel::new().with_kernel("shared"));
    let mut config = ServerConfig::default();
    config.notebook.kernel_id = Some("shared".into());
    let connector = MemoryConnector::new(Arc::new(store), kernel.clone());
    let bridge = ExecutionBridge::new(Arc::new(connector), config.session_config().unwrap());

    bridge.run_code("1+1", None).await.unwrap();
    bridge.shutdown().await;
    assert_eq!(kernel.kernels_started(), 0);
    assert_eq!(kernel.kernels_running(), 1);
}

#[tokio::test]
async fn test_missing_ack_degrades_then_recovers() {
    let h = harness();
    h.bridge.connect().await.unwrap();
    h.store.suspend_acks(true);

    let err = h.bridge.add_markdown("lost").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(h.bridge.connection_states().await.0, ConnectionState::Degraded);

    h.store.suspend_acks(false);
    h.bridge.add_markdown("kept").await.unwrap();
    let content = h.bridge.read_notebook().await.unwrap();
    assert_eq!(content.total_cells, 2);
}
