//! WebSocket channel built on tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use notebook_mcp_core::{Error, Result};

use crate::channel::{Channel, FrameChannel};
use crate::jupyter::status_error;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket carrying JSON messages ([`Channel`]) or binary frames
/// ([`FrameChannel`]).
pub struct WsChannel {
    stream: Option<Stream>,
    /// Endpoint without query string, for logs
    endpoint: String,
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("endpoint", &self.endpoint)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl WsChannel {
    /// Open a WebSocket to `url`, authenticating with `token` if non-empty.
    ///
    /// HTTP 401/403 during the upgrade maps to `Auth`, 404 to `NotFound`,
    /// network failures and handshake timeouts to `Unreachable`.
    pub async fn connect(url: &Url, token: &str, timeout: Duration) -> Result<Self> {
        let endpoint = log_endpoint(url);
        debug!("Opening WebSocket: endpoint={}", endpoint);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|_| Error::Config("token contains invalid header characters".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                Error::Unreachable(format!(
                    "WebSocket handshake with {endpoint} timed out after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(map_ws_error)?;

        info!(
            "WebSocket connected: endpoint={}, status={}",
            endpoint,
            response.status()
        );

        Ok(Self {
            stream: Some(stream),
            endpoint,
        })
    }

    async fn send_message(&mut self, message: Message) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.send(message).await.map_err(map_ws_error)
    }

    /// Payload of the next data frame, text or binary.
    async fn next_payload(&mut self) -> Option<Result<Vec<u8>>> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: endpoint={}, frame={:?}", self.endpoint, frame);
                    return None;
                }
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => {
                    warn!("WebSocket receive failed: endpoint={}, error={}", self.endpoint, e);
                    return Some(Err(map_ws_error(e)));
                }
            }
        }
    }

    async fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!("Error closing WebSocket {}: {}", self.endpoint, e);
            }
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, message: Value) -> Result<()> {
        self.send_message(Message::Text(message.to_string())).await
    }

    async fn recv(&mut self) -> Option<Result<Value>> {
        let payload = self.next_payload().await?;
        Some(payload.and_then(|bytes| parse_frame(&bytes)))
    }

    async fn close(&mut self) {
        self.close_stream().await;
    }
}

#[async_trait]
impl FrameChannel for WsChannel {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.send_message(Message::Binary(frame)).await
    }

    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>>> {
        self.next_payload().await
    }

    async fn shutdown(&mut self) {
        self.close_stream().await;
    }
}

fn parse_frame(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("frame is not JSON: {e}")))
}

fn log_endpoint(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.to_string()
}

/// Map a tungstenite error onto the bridge error taxonomy.
pub(crate) fn map_ws_error(error: WsError) -> Error {
    match error {
        WsError::Http(response) => status_error(response.status().as_u16(), "WebSocket upgrade"),
        WsError::Io(e) => Error::Unreachable(e.to_string()),
        WsError::Url(e) => Error::Config(format!("invalid WebSocket URL: {e}")),
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::NotConnected,
        other => Error::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        let value = parse_frame(br#"{"type": "ack", "request_id": "r"}"#).unwrap();
        assert_eq!(value["type"], "ack");
        assert!(matches!(parse_frame(b"not json"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_log_endpoint_strips_query() {
        let url = Url::parse("ws://localhost:8888/api/kernels/k/channels?session_id=s&token=t").unwrap();
        assert_eq!(log_endpoint(&url), "ws://localhost:8888/api/kernels/k/channels");
    }

    #[test]
    fn test_map_io_error() {
        let err = map_ws_error(WsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[test]
    fn test_map_closed_error() {
        assert!(matches!(map_ws_error(WsError::ConnectionClosed), Error::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Port 9 (discard) is essentially never listening on loopback
        let url = Url::parse("ws://127.0.0.1:9/api/kernels/x/channels").unwrap();
        let err = WsChannel::connect(&url, "", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)), "got {err:?}");
    }
}
