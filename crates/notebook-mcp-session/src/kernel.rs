//! Client for a running kernel over the Jupyter messaging protocol.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use notebook_mcp_core::protocol::{
    ExecutionState, IopubEvent, KernelChannel, KernelMessage, PROTOCOL_MAJOR,
};
use notebook_mcp_core::{ConnectionHandle, ConnectionState, Error, Output, Result, SessionConfig};
use notebook_mcp_transport::{Channel, Connector, KernelTarget};

/// One event of an execution, in kernel emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// An output; an error output ends the execution
    Output(Output),
    /// A display output carrying a display id
    Display {
        /// `transient.display_id`
        display_id: String,
        /// The display output
        output: Output,
    },
    /// Replace every earlier display with this id
    UpdateDisplay {
        /// `transient.display_id`
        display_id: String,
        /// Replacement output
        output: Output,
    },
    /// Clear outputs produced so far (deferred until the next output when `wait`)
    ClearOutput {
        /// Defer clearing
        wait: bool,
    },
    /// The kernel went idle for this execution
    Completed {
        /// Counter assigned to the execution
        execution_count: Option<u32>,
    },
}

/// Connection to one kernel.
pub struct KernelClient {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    session_id: String,
    target: Option<KernelTarget>,
    kernel_id: Option<String>,
    channel: Option<Box<dyn Channel>>,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    /// Execution whose handle was dropped before it finished
    abandoned: Option<String>,
    /// Execution that ended before its idle status arrived
    unsettled: Option<String>,
    /// The kernel was started by this client
    started: bool,
}

impl KernelClient {
    /// Create a disconnected client identified by `session_id` on the kernel channel.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &SessionConfig,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            connect_timeout: config.connect_timeout,
            session_id: session_id.into(),
            target: None,
            kernel_id: None,
            channel: None,
            state: ConnectionState::Disconnected,
            handle: None,
            abandoned: None,
            unsettled: None,
            started: false,
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

    /// Id of the attached kernel, once resolved.
    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }

    /// Resolve the kernel, open its channel and perform the `kernel_info` handshake.
    ///
    /// Connecting again to the same target while connected returns the
    /// existing handle. A kernel started by an earlier connect is reused on
    /// reconnect.
    pub async fn connect(&mut self, target: &KernelTarget) -> Result<ConnectionHandle> {
        if self.target.as_ref() == Some(target) {
            if let (ConnectionState::Connected, Some(handle)) = (self.state, &self.handle) {
                debug!("Kernel already connected: id={}", handle.target);
                return Ok(handle.clone());
            }
        } else {
            self.shutdown().await;
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
                warn!("Kernel connect failed: {}", e);
                self.channel = None;
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

    /// Reconnect to the last target.
    pub async fn reconnect(&mut self) -> Result<ConnectionHandle> {
        let target = self.target.clone().ok_or(Error::NotConnected)?;
        self.channel = None;
        self.handle = None;
        self.connect(&target).await
    }

    async fn handshake(&mut self, target: &KernelTarget) -> Result<ConnectionHandle> {
        let connect_timeout = self.connect_timeout;
        let deadline = Instant::now() + connect_timeout;
        let timed_out = move || {
            Error::Unreachable(format!(
                "kernel handshake did not complete within {}ms",
                connect_timeout.as_millis()
            ))
        };

        let kernel_id = match &self.kernel_id {
            Some(id) => id.clone(),
            None => {
                let id = tokio::time::timeout_at(deadline, self.connector.resolve_kernel(target))
                    .await
                    .map_err(|_| timed_out())??;
                self.kernel_id = Some(id.clone());
                self.started = target.kernel_id.is_none();
                id
            }
        };

        let mut channel =
            tokio::time::timeout_at(deadline, self.connector.open_kernel(target, &kernel_id))
                .await
                .map_err(|_| timed_out())??;

        let request = KernelMessage::kernel_info_request(&self.session_id);
        channel.send(request.to_value()?).await?;

        let reply = loop {
            let frame = tokio::time::timeout_at(deadline, channel.recv())
                .await
                .map_err(|_| timed_out())?;
            let value = match frame {
                Some(value) => value?,
                None => {
                    return Err(Error::Unreachable(format!(
                        "kernel '{kernel_id}' closed the channel during handshake"
                    )))
                }
            };
            let message = KernelMessage::from_value(value)?;
            if message.msg_type() == "kernel_info_reply"
                && message.parent_msg_id() == Some(request.msg_id())
            {
                break message;
            }
            debug!("Ignoring {} during handshake", message.msg_type());
        };

        match reply.protocol_major() {
            Some(PROTOCOL_MAJOR) => {}
            Some(major) => {
                return Err(Error::ProtocolMismatch(format!(
                    "kernel speaks messaging protocol {major}, expected {PROTOCOL_MAJOR}"
                )))
            }
            None => {
                return Err(Error::ProtocolMismatch(
                    "kernel_info_reply carries no protocol_version".into(),
                ))
            }
        }

        info!("Kernel connected: id={}", kernel_id);
        self.channel = Some(channel);
        self.abandoned = None;
        self.unsettled = None;
        Ok(ConnectionHandle::new(kernel_id))
    }

    /// Close the channel. The kernel keeps running.
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.handle = None;
        if self.state != ConnectionState::Disconnected {
            info!("Kernel disconnected");
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Close the channel and stop the kernel if this client started it.
    pub async fn shutdown(&mut self) {
        self.disconnect().await;
        let Some(kernel_id) = self.kernel_id.take() else {
            return;
        };
        if !std::mem::take(&mut self.started) {
            return;
        }
        let Some(target) = self.target.as_ref() else {
            return;
        };
        let stop = self.connector.shutdown_kernel(target, &kernel_id);
        match tokio::time::timeout(self.connect_timeout, stop).await {
            Ok(Ok(())) => info!("Kernel stopped: id={}", kernel_id),
            Ok(Err(e)) => warn!("Failed to stop kernel {}: {}", kernel_id, e),
            Err(_) => warn!("Timed out stopping kernel {}", kernel_id),
        }
    }

    /// Drain messages already received and detect a lost channel.
    ///
    /// Drained messages belong to no live execution and are dropped.
    pub fn refresh(&mut self) -> Result<()> {
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
                    return Err(Error::ExecutionInterrupted(
                        "kernel connection closed".into(),
                    ));
                }
                Some(Some(Err(e))) if e.is_connection_failure() => {
                    self.mark_degraded();
                    return Err(Error::ExecutionInterrupted(format!(
                        "kernel connection failed: {e}"
                    )));
                }
                Some(Some(Err(e))) => warn!("Skipping kernel channel error: {}", e),
                Some(Some(Ok(value))) => match KernelMessage::from_value(value) {
                    Ok(message) => {
                        debug!("Dropping stale {}", message.msg_type());
                        self.note_idle(&message);
                    }
                    Err(e) => warn!("Skipping malformed kernel message: {}", e),
                },
            }
        }
    }

    /// Move to `Degraded` and drop the channel.
    pub fn mark_degraded(&mut self) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Connecting {
            warn!("Kernel connection degraded");
            self.transition(ConnectionState::Degraded);
        }
        self.channel = None;
        self.handle = None;
    }

    /// Submit code for execution without waiting for it.
    ///
    /// An execution abandoned by a dropped handle is interrupted first.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionHandle<'_>> {
        if !self.state.can_mutate() {
            return Err(Error::NotConnected);
        }
        if let Some(previous) = self.abandoned.take() {
            info!("Interrupting abandoned execution: msg_id={}", previous);
            self.send(KernelMessage::interrupt_request(&self.session_id))
                .await?;
            self.unsettled = Some(previous);
        }
        self.settle().await?;

        let request = KernelMessage::execute_request(&self.session_id, code);
        let msg_id = request.msg_id().to_string();
        self.send(request).await?;
        debug!("Execution submitted: msg_id={}", msg_id);

        Ok(ExecutionHandle {
            client: self,
            msg_id,
            execution_count: None,
            finished: false,
        })
    }

    /// Restart the kernel process, keeping the connection.
    pub async fn restart(&mut self) -> Result<()> {
        if !self.state.can_mutate() {
            return Err(Error::NotConnected);
        }
        let request = KernelMessage::shutdown_request(&self.session_id, true);
        let msg_id = request.msg_id().to_string();
        self.send(request).await?;
        self.abandoned = None;
        self.unsettled = None;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let message = match self.recv(Some(deadline)).await {
                Ok(message) => message,
                Err(Error::Timeout(ms)) => {
                    warn!("No shutdown_reply within {}ms", ms);
                    return Err(Error::Timeout(ms));
                }
                Err(e) => return Err(e),
            };
            if message.msg_type() == "shutdown_reply" && message.parent_msg_id() == Some(&msg_id) {
                info!("Kernel restarted: id={:?}", self.kernel_id);
                return Ok(());
            }
        }
    }

    /// Wait for the idle status of an execution that ended early.
    ///
    /// The kernel aborts requests that arrive while it unwinds an error.
    async fn settle(&mut self) -> Result<()> {
        let Some(msg_id) = self.unsettled.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.connect_timeout;
        while self.unsettled.is_some() {
            match self.recv(Some(deadline)).await {
                Ok(message) => self.note_idle(&message),
                Err(Error::Timeout(ms)) => {
                    warn!("Kernel not idle {}ms after msg_id={}, sending anyway", ms, msg_id);
                    self.unsettled = None;
                }
                Err(e) => return Err(e),
            }
        }
        debug!("Execution settled: msg_id={}", msg_id);
        Ok(())
    }

    /// Forget early-ended executions once their idle status shows up.
    fn note_idle(&mut self, message: &KernelMessage) {
        let idle = message.kernel_channel() == Some(KernelChannel::IoPub)
            && matches!(message.iopub_event(), Ok(IopubEvent::Status(ExecutionState::Idle)));
        let Some(parent) = message.parent_msg_id().filter(|_| idle) else {
            return;
        };
        if self.unsettled.as_deref() == Some(parent) {
            self.unsettled = None;
        }
        if self.abandoned.as_deref() == Some(parent) {
            debug!("Abandoned execution finished on its own: msg_id={}", parent);
            self.abandoned = None;
        }
    }

    async fn send(&mut self, message: KernelMessage) -> Result<()> {
        let value = message.to_value()?;
        let result = match self.channel.as_mut() {
            Some(channel) => channel.send(value).await,
            None => Err(Error::NotConnected),
        };
        if let Err(e) = result {
            if e.is_connection_failure() {
                self.mark_degraded();
                return Err(Error::ExecutionInterrupted(format!(
                    "kernel connection lost: {e}"
                )));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Next well-formed message; `Timeout` if `deadline` passes first.
    async fn recv(&mut self, deadline: Option<Instant>) -> Result<KernelMessage> {
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        loop {
            let frame = match (self.channel.as_mut(), deadline) {
                (Some(channel), Some(deadline)) => tokio::time::timeout_at(deadline, channel.recv())
                    .await
                    .map_err(|_| Error::Timeout(timeout_ms))?,
                (Some(channel), None) => channel.recv().await,
                (None, _) => return Err(Error::NotConnected),
            };
            match frame {
                Some(Ok(value)) => match KernelMessage::from_value(value) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!("Skipping malformed kernel message: {}", e),
                },
                Some(Err(e)) if !e.is_connection_failure() => {
                    warn!("Skipping kernel channel error: {}", e);
                }
                Some(Err(e)) => {
                    self.mark_degraded();
                    return Err(Error::ExecutionInterrupted(format!(
                        "kernel connection failed: {e}"
                    )));
                }
                None => {
                    self.mark_degraded();
                    return Err(Error::ExecutionInterrupted(
                        "kernel connection closed".into(),
                    ));
                }
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Kernel state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("kernel_id", &self.kernel_id)
            .field("state", &self.state)
            .field("abandoned", &self.abandoned)
            .field("unsettled", &self.unsettled)
            .field("started", &self.started)
            .finish()
    }
}

/// One in-flight execution and its event stream.
///
/// The handle borrows the client mutably, so at most one exists at a time.
pub struct ExecutionHandle<'a> {
    client: &'a mut KernelClient,
    msg_id: String,
    execution_count: Option<u32>,
    finished: bool,
}

impl ExecutionHandle<'_> {
    /// `msg_id` of the `execute_request`.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event of this execution; `None` once it has ended.
    ///
    /// Cancel safe: dropping the future loses no event.
    pub async fn next(&mut self) -> Option<Result<ExecutionEvent>> {
        if self.finished {
            return None;
        }
        loop {
            let message = match self.client.recv(None).await {
                Ok(message) => message,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            if message.parent_msg_id() != Some(self.msg_id.as_str()) {
                debug!(
                    "Discarding {} for another request: parent={:?}",
                    message.msg_type(),
                    message.parent_msg_id()
                );
                continue;
            }
            if let Some(event) = self.interpret(&message) {
                return Some(event);
            }
        }
    }

    fn interpret(&mut self, message: &KernelMessage) -> Option<Result<ExecutionEvent>> {
        match message.kernel_channel() {
            Some(KernelChannel::IoPub) => {}
            Some(KernelChannel::Shell) if message.msg_type() == "execute_reply" => {
                if let Some(count) = message.execution_count() {
                    self.execution_count = Some(count);
                }
                if message.reply_status() != Some("aborted") {
                    return None;
                }
                warn!("Execution aborted by the kernel: msg_id={}", self.msg_id);
                self.finish_early();
                return Some(Ok(ExecutionEvent::Output(Output::Error {
                    ename: "ExecutionAborted".into(),
                    evalue: "kernel aborted the request after an earlier error".into(),
                    traceback: Vec::new(),
                })));
            }
            _ => return None,
        }

        let event = match message.iopub_event() {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping unreadable iopub message: {}", e);
                return None;
            }
        };
        match event {
            IopubEvent::Status(ExecutionState::Idle) => {
                self.finished = true;
                Some(Ok(ExecutionEvent::Completed {
                    execution_count: self.execution_count,
                }))
            }
            IopubEvent::Status(ExecutionState::Dead) => {
                self.finished = true;
                self.client.mark_degraded();
                Some(Err(Error::ExecutionInterrupted("kernel died".into())))
            }
            IopubEvent::Status(_) | IopubEvent::Other => None,
            IopubEvent::ExecuteInput { execution_count } => {
                self.execution_count = execution_count.or(self.execution_count);
                None
            }
            IopubEvent::Output(output) => {
                if let Output::ExecuteResult {
                    execution_count: Some(count),
                    ..
                } = &output
                {
                    self.execution_count = Some(*count);
                }
                if output.is_error() {
                    self.finish_early();
                }
                Some(Ok(ExecutionEvent::Output(output)))
            }
            IopubEvent::Display { display_id, output } => {
                Some(Ok(ExecutionEvent::Display { display_id, output }))
            }
            IopubEvent::UpdateDisplay { display_id, output } => {
                Some(Ok(ExecutionEvent::UpdateDisplay { display_id, output }))
            }
            IopubEvent::ClearOutput { wait } => Some(Ok(ExecutionEvent::ClearOutput { wait })),
        }
    }

    /// End the stream before the kernel reported idle.
    fn finish_early(&mut self) {
        self.finished = true;
        self.client.unsettled = Some(self.msg_id.clone());
    }

    /// Best-effort interrupt of this execution. Ends the event stream.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finish_early();
        info!("Interrupting execution: msg_id={}", self.msg_id);
        let request = KernelMessage::interrupt_request(&self.client.session_id);
        self.client.send(request).await
    }
}

impl Drop for ExecutionHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Execution handle dropped unfinished: msg_id={}", self.msg_id);
            self.client.abandoned = Some(std::mem::take(&mut self.msg_id));
        }
    }
}

impl std::fmt::Debug for ExecutionHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("msg_id", &self.msg_id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDocumentStore, FakeKernel};
    use async_trait::async_trait;
    use notebook_mcp_core::{ServerConfig, StreamName};
    use notebook_mcp_transport::{DocumentTarget, MemoryConnector};
    use serde_json::Value;

    fn connector(kernel: &Arc<FakeKernel>) -> MemoryConnector {
        MemoryConnector::new(
            Arc::new(FakeDocumentStore::new("notebook.ipynb")),
            kernel.clone(),
        )
    }

    fn setup(kernel: &Arc<FakeKernel>) -> (KernelClient, KernelTarget) {
        let config = ServerConfig::default().session_config().unwrap();
        let client = KernelClient::new(Arc::new(connector(kernel)), &config, "test-session");
        (client, KernelTarget::from(&config))
    }

    /// Kernel channel that yields one garbled frame after each execute request.
    struct Garbling {
        inner: Box<dyn Channel>,
        pending: bool,
    }

    #[async_trait]
    impl Channel for Garbling {
        async fn send(&mut self, message: Value) -> Result<()> {
            if message.pointer("/header/msg_type").and_then(Value::as_str) == Some("execute_request") {
                self.pending = true;
            }
            self.inner.send(message).await
        }

        async fn recv(&mut self) -> Option<Result<Value>> {
            if std::mem::take(&mut self.pending) {
                return Some(Err(Error::Protocol("garbled frame".into())));
            }
            self.inner.recv().await
        }

        async fn close(&mut self) {
            self.inner.close().await
        }
    }

    struct GarblingConnector(MemoryConnector);

    #[async_trait]
    impl Connector for GarblingConnector {
        async fn open_document(&self, target: &DocumentTarget) -> Result<Box<dyn Channel>> {
            self.0.open_document(target).await
        }

        async fn resolve_kernel(&self, target: &KernelTarget) -> Result<String> {
            self.0.resolve_kernel(target).await
        }

        async fn open_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<Box<dyn Channel>> {
            let inner = self.0.open_kernel(target, kernel_id).await?;
            Ok(Box::new(Garbling {
                inner,
                pending: false,
            }))
        }

        async fn shutdown_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<()> {
            self.0.shutdown_kernel(target, kernel_id).await
        }
    }

    async fn collect(handle: &mut ExecutionHandle<'_>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        let handle = client.connect(&target).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(handle.target, client.kernel_id().unwrap());
        assert_eq!(kernel.handshakes(), 1);

        let again = client.connect(&target).await.unwrap();
        assert_eq!(again.id, handle.id);
        assert_eq!(kernel.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_protocol_mismatch() {
        let kernel = Arc::new(FakeKernel::new().with_protocol_version("4.1"));
        let (mut client, target) = setup(&kernel);
        let err = client.connect(&target).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bad_token_is_auth_error() {
        let kernel = Arc::new(FakeKernel::new().with_token("secret"));
        let (mut client, target) = setup(&kernel);
        let err = client.connect(&target).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_execute_requires_connection() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, _) = setup(&kernel);
        assert!(matches!(client.execute("1").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_execute_stream_then_completed() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client.execute("print('hello')").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(
            events[0],
            ExecutionEvent::Output(Output::Stream {
                name: StreamName::Stdout,
                text: "hello\n".into()
            })
        );
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::Completed {
                execution_count: Some(1)
            })
        ));
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_output_is_terminal() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client.execute("raise ValueError('x')").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ExecutionEvent::Output(o) if o.is_error()));
        drop(handle);

        // The idle of the failed execution is filtered out of the next one
        let mut handle = client.execute("1+1").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events[0], ExecutionEvent::Output(Output::plain_result(Some(2), "2")));
    }

    #[tokio::test]
    async fn test_cancel_interrupts() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client.execute("import time\ntime.sleep(30)").await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(100), handle.next()).await;
        assert!(next.is_err());
        handle.cancel().await.unwrap();
        assert!(handle.next().await.is_none());
        drop(handle);

        let mut handle = client.execute("print('still alive')").await.unwrap();
        let events = collect(&mut handle).await;
        assert!(events.contains(&ExecutionEvent::Output(Output::stdout("still alive\n"))));
        assert_eq!(kernel.interrupts(), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_interrupted_on_next_execute() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let handle = client.execute("time.sleep(30)").await.unwrap();
        drop(handle);
        let mut handle = client.execute("print('next')").await.unwrap();
        let events = collect(&mut handle).await;
        assert!(events.contains(&ExecutionEvent::Output(Output::stdout("next\n"))));
        assert_eq!(kernel.interrupts(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_interrupts_execution() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client.execute("print('a')\n__disconnect__").await.unwrap();
        let mut saw_error = false;
        while let Some(event) = handle.next().await {
            if let Err(e) = event {
                assert!(matches!(e, Error::ExecutionInterrupted(_)));
                saw_error = true;
            }
        }
        assert!(saw_error);
        drop(handle);
        assert_eq!(client.state(), ConnectionState::Degraded);

        client.reconnect().await.unwrap();
        assert_eq!(kernel.handshakes(), 2);
        assert_eq!(kernel.kernels_started(), 1);
    }

    #[tokio::test]
    async fn test_restart() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client.execute("1+1").await.unwrap();
        collect(&mut handle).await;
        drop(handle);

        client.restart().await.unwrap();
        assert_eq!(kernel.restarts(), 1);

        // Counter starts over after a restart
        let mut handle = client.execute("2+2").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events[0], ExecutionEvent::Output(Output::plain_result(Some(1), "4")));
    }

    #[tokio::test]
    async fn test_channel_error_skipped() {
        let kernel = Arc::new(FakeKernel::new());
        let config = ServerConfig::default().session_config().unwrap();
        let connector = GarblingConnector(connector(&kernel));
        let mut client = KernelClient::new(Arc::new(connector), &config, "test-session");
        client.connect(&KernelTarget::from(&config)).await.unwrap();

        let mut handle = client.execute("print('through')").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events[0], ExecutionEvent::Output(Output::stdout("through\n")));
        assert!(matches!(events.last(), Some(ExecutionEvent::Completed { .. })));
        drop(handle);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_refresh_detects_dropped_connection() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();
        client.refresh().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        kernel.drop_connections();
        let err = client.refresh().unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(client.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_aborted_request_reported_as_error() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        kernel.abort_next_execution();
        let mut handle = client.execute("print('never')").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ExecutionEvent::Output(Output::Error { ename, .. }) => {
                assert_eq!(ename, "ExecutionAborted")
            }
            other => panic!("unexpected event {other:?}"),
        }
        drop(handle);

        let mut handle = client.execute("1+1").await.unwrap();
        let events = collect(&mut handle).await;
        assert_eq!(events[0], ExecutionEvent::Output(Output::plain_result(Some(1), "2")));
    }

    #[tokio::test]
    async fn test_request_after_failure_not_aborted() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        // Stops reading at the error; the idle is still in flight
        let mut handle = client.execute("print('a')\nraise ValueError('x')").await.unwrap();
        while handle.next().await.is_some() {}
        drop(handle);

        let mut handle = client.execute("print('b')").await.unwrap();
        let events = collect(&mut handle).await;
        assert!(events.contains(&ExecutionEvent::Output(Output::stdout("b\n"))));
    }

    #[tokio::test]
    async fn test_display_events_carry_id() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();

        let mut handle = client
            .execute("display('0%', display_id='bar')\nupdate_display('100%', display_id='bar')")
            .await
            .unwrap();
        let events = collect(&mut handle).await;
        assert!(matches!(
            &events[0],
            ExecutionEvent::Display { display_id, output } if display_id == "bar" && output.render() == "0%"
        ));
        assert!(matches!(
            &events[1],
            ExecutionEvent::UpdateDisplay { display_id, output } if display_id == "bar" && output.render() == "100%"
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_started_kernel() {
        let kernel = Arc::new(FakeKernel::new());
        let (mut client, target) = setup(&kernel);
        client.connect(&target).await.unwrap();
        assert_eq!(kernel.kernels_running(), 1);

        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.kernel_id().is_none());
        assert_eq!(kernel.kernels_running(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_configured_kernel() {
        let kernel = Arc::new(FakeKernel::new().with_kernel("existing"));
        let mut config = ServerConfig::default();
        config.notebook.kernel_id = Some("existing".into());
        let config = config.session_config().unwrap();
        let mut client = KernelClient::new(Arc::new(connector(&kernel)), &config, "test-session");
        client.connect(&KernelTarget::from(&config)).await.unwrap();
        assert_eq!(kernel.kernels_started(), 0);

        client.shutdown().await;
        assert_eq!(kernel.kernels_running(), 1);
    }
}
