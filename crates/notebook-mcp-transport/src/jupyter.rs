//! Jupyter server endpoints.
//!
//! Documents are reached through the collaboration extension: a REST call
//! turns the notebook path into a room id, then the room is opened as a
//! WebSocket speaking Y-sync (see [`crate::ydoc`]). Kernels are looked up
//! (or started, and stopped again) over REST and their message channel
//! opened as a WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};
use url::Url;

use notebook_mcp_core::{Error, Result};

use crate::channel::{Channel, Connector, DocumentTarget, KernelTarget};
use crate::websocket::WsChannel;
use crate::ydoc::YNotebookChannel;

/// Connector for a real Jupyter server.
#[derive(Debug, Clone)]
pub struct JupyterConnector {
    http: reqwest::Client,
    connect_timeout: Duration,
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaborationSession {
    file_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct KernelModel {
    id: String,
}

impl JupyterConnector {
    /// Create a connector whose requests and handshakes time out after `connect_timeout`.
    ///
    /// `session_id` identifies this client on kernel channels.
    pub fn new(connect_timeout: Duration, session_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            connect_timeout,
            session_id: session_id.into(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.header(reqwest::header::AUTHORIZATION, format!("token {token}"))
        }
    }

    async fn resolve_room(&self, target: &DocumentTarget) -> Result<Url> {
        let mut segments = vec!["api", "collaboration", "session"];
        segments.extend(target.path.split('/').filter(|s| !s.is_empty()));
        let url = http_endpoint(&target.server_url, &segments)?;

        debug!("Resolving collaboration room: path={}", target.path);
        let request = self
            .http
            .put(url)
            .json(&json!({ "format": "json", "type": "notebook" }));
        let response = self
            .authorize(request, &target.token)
            .send()
            .await
            .map_err(map_http_error)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(status_error(status, &format!("notebook '{}'", target.path)));
        }
        let session: CollaborationSession = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid collaboration session: {e}")))?;

        let room = format!("json:notebook:{}", session.file_id);
        let mut url = websocket_url(http_endpoint(
            &target.server_url,
            &["api", "collaboration", "room", room.as_str()],
        )?)?;
        url.query_pairs_mut().append_pair("sessionId", &session.session_id);
        info!("Collaboration room resolved: path={}, room={}", target.path, room);
        Ok(url)
    }
}

#[async_trait]
impl Connector for JupyterConnector {
    async fn open_document(&self, target: &DocumentTarget) -> Result<Box<dyn Channel>> {
        let url = self.resolve_room(target).await?;
        let frames = WsChannel::connect(&url, &target.token, self.connect_timeout).await?;
        Ok(Box::new(YNotebookChannel::new(frames)))
    }

    async fn resolve_kernel(&self, target: &KernelTarget) -> Result<String> {
        let response = if let Some(kernel_id) = &target.kernel_id {
            debug!("Looking up kernel: id={}", kernel_id);
            let url = http_endpoint(&target.server_url, &["api", "kernels", kernel_id.as_str()])?;
            self.authorize(self.http.get(url), &target.token)
                .send()
                .await
                .map_err(map_http_error)?
        } else {
            info!("Starting kernel: name={}", target.kernel_name);
            let url = http_endpoint(&target.server_url, &["api", "kernels"])?;
            let request = self.http.post(url).json(&json!({ "name": target.kernel_name }));
            self.authorize(request, &target.token)
                .send()
                .await
                .map_err(map_http_error)?
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let what = match &target.kernel_id {
                Some(id) => format!("kernel '{id}'"),
                None => format!("kernelspec '{}'", target.kernel_name),
            };
            return Err(status_error(status, &what));
        }
        let kernel: KernelModel = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid kernel model: {e}")))?;
        info!("Kernel resolved: id={}", kernel.id);
        Ok(kernel.id)
    }

    async fn open_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<Box<dyn Channel>> {
        let url = kernel_channels_url(&target.server_url, kernel_id, &self.session_id)?;
        let channel = WsChannel::connect(&url, &target.token, self.connect_timeout).await?;
        Ok(Box::new(channel))
    }

    async fn shutdown_kernel(&self, target: &KernelTarget, kernel_id: &str) -> Result<()> {
        info!("Stopping kernel: id={}", kernel_id);
        let url = http_endpoint(&target.server_url, &["api", "kernels", kernel_id])?;
        let response = self
            .authorize(self.http.delete(url), &target.token)
            .send()
            .await
            .map_err(map_http_error)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(status_error(status, &format!("kernel '{kernel_id}'")));
        }
        Ok(())
    }
}

/// Append path segments to the server base URL, keeping any base prefix
/// (e.g. `/user/alice/` behind JupyterHub).
pub fn http_endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("server URL '{base}' cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Switch an http(s) URL to ws(s).
pub fn websocket_url(mut url: Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive WebSocket URL from '{url}'")))?;
    Ok(url)
}

/// `ws(s)://.../api/kernels/{id}/channels?session_id=...`
pub fn kernel_channels_url(base: &Url, kernel_id: &str, session_id: &str) -> Result<Url> {
    let mut url = websocket_url(http_endpoint(base, &["api", "kernels", kernel_id, "channels"])?)?;
    url.query_pairs_mut().append_pair("session_id", session_id);
    Ok(url)
}

/// Map an HTTP status of a failed request onto the bridge error taxonomy.
pub(crate) fn status_error(status: u16, what: &str) -> Error {
    match status {
        401 | 403 => Error::Auth(format!("{what}: server returned HTTP {status}")),
        404 => Error::NotFound(what.to_string()),
        _ => {
            error!("Unexpected HTTP status for {}: {}", what, status);
            Error::Unreachable(format!("{what}: server returned HTTP {status}"))
        }
    }
}

fn map_http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Unreachable(format!("request timed out: {e}"))
    } else if e.is_connect() {
        Error::Unreachable(format!("connection failed: {e}"))
    } else {
        Error::Unreachable(e.to_string())
    }
}
