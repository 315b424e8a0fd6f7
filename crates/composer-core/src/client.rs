//! JSON-RPC client for talking to one MCP server over any [`Transport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ComposerError, Result};
use crate::pending::PendingTable;
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListResourcesResult,
    ListToolsResult, PromptInfo, ResourceInfo, ToolInfo, methods,
};
use crate::transport::{Envelope, Subscription, Transport};

/// Upper bound on `nextCursor` pages followed by a single list call.
const MAX_LIST_PAGES: usize = 64;

/// Correlating client for one server connection.
///
/// A dispatcher task reads the transport's inbound feed: responses resolve
/// pending requests, notifications are re-broadcast to subscribers, and
/// server-initiated `ping` requests are answered.
pub struct RpcClient {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    next_id: AtomicI64,
    timeout: Duration,
    server_info: RwLock<Option<InitializeResult>>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    cancel: CancellationToken,
    closed: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Connect the transport and start dispatching its inbound feed.
    pub async fn connect(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        transport.connect().await?;

        let cancel = CancellationToken::new();
        let inbound = transport.subscribe(cancel.child_token())?;
        let (notifications, _) = broadcast::channel(64);

        let client = Arc::new(Self {
            name,
            transport,
            pending: PendingTable::new("rpc-client"),
            next_id: AtomicI64::new(1),
            timeout,
            server_info: RwLock::new(None),
            notifications,
            cancel,
            closed: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        });

        let task = tokio::spawn(dispatch(Arc::downgrade(&client), inbound));
        *client.dispatcher.lock() = Some(task);

        tracing::debug!(server = %client.name, "RPC client connected");
        Ok(client)
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Result of the `initialize` handshake, if it has run.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().clone()
    }

    /// Notifications sent by the server.
    pub fn notifications(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Cancelled once the connection is gone.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Check if the connection is alive.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.transport.is_connected()
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let response = self.request_raw(method, params).await?;
        response.into_result().map_err(ComposerError::Downstream)
    }

    async fn request_raw(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.closed.is_cancelled() {
            return Err(ComposerError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let handle = self.pending.register(request.id.clone())?;

        tracing::trace!(server = %self.name, id, method, "Sending request");
        self.transport.send(Envelope::new(request)).await?;
        handle.wait(self.timeout, &self.cancel).await
    }

    async fn request_typed<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.transport
            .send(Envelope::new(JsonRpcNotification::new(method, params)))
            .await
    }

    /// Run the MCP `initialize` handshake.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self.request_typed(methods::INITIALIZE, Some(params)).await?;
        self.notify(methods::INITIALIZED, None).await?;

        tracing::info!(
            server = %self.name,
            server_name = %result.server_info.name,
            server_version = ?result.server_info.version,
            protocol = %result.protocol_version,
            "Handshake complete"
        );
        *self.server_info.write() = Some(result.clone());
        Ok(result)
    }

    /// List all tools, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListToolsResult = self
                .request_typed(methods::TOOLS_LIST, cursor.as_ref().map(|c| json!({"cursor": c})))
                .await?;
            tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        tracing::debug!(server = %self.name, count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// List all prompts, following pagination.
    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListPromptsResult = self
                .request_typed(methods::PROMPTS_LIST, cursor.as_ref().map(|c| json!({"cursor": c})))
                .await?;
            prompts.extend(page.prompts);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(prompts)
    }

    /// List all resources, following pagination.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListResourcesResult = self
                .request_typed(methods::RESOURCES_LIST, cursor.as_ref().map(|c| json!({"cursor": c})))
                .await?;
            resources.extend(page.resources);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(resources)
    }

    /// Call a tool. The server's result is returned unmodified.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        tracing::debug!(server = %self.name, tool = %name, "Calling tool");
        self.request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await
    }

    /// JSON-RPC `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Cancel outstanding requests and disconnect the transport.
    pub async fn shutdown(&self) {
        tracing::debug!(server = %self.name, "Shutting down RPC client");
        self.cancel.cancel();
        self.closed.cancel();
        self.pending.cancel_all();
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(server = %self.name, error = %e, "Transport disconnect failed");
        }
        let task = self.dispatcher.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn answer_server_request(&self, request: JsonRpcRequest) {
        let response = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            JsonRpcResponse::failure(
                Some(request.id),
                JsonRpcError::new(
                    JsonRpcError::METHOD_NOT_FOUND,
                    format!("method '{}' is not supported by this client", request.method),
                ),
            )
        };
        if let Err(e) = self.transport.send(Envelope::new(response)).await {
            tracing::debug!(server = %self.name, error = %e, "Failed to answer server request");
        }
    }
}

async fn dispatch(client: std::sync::Weak<RpcClient>, mut inbound: Subscription) {
    while let Some(envelope) = inbound.next().await {
        let Some(client) = client.upgrade() else {
            return;
        };
        match envelope.message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !client.pending.resolve(response) {
                    tracing::trace!(server = %client.name, id = ?id, "Dropping uncorrelated response");
                }
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::trace!(server = %client.name, method = %notification.method, "Notification");
                let _ = client.notifications.send(notification);
            }
            JsonRpcMessage::Request(request) => {
                client.answer_server_request(request).await;
            }
        }
    }

    if let Some(client) = client.upgrade() {
        client.closed.cancel();
        client.pending.fail_all(|| ComposerError::ConnectionClosed);
        tracing::debug!(server = %client.name, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::EventSink;
    use crate::protocol::RequestId;
    use crate::transport::StdioTransport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// Client wired to an in-memory peer that answers with `respond`.
    async fn client_with_peer<F>(respond: F) -> Arc<RpcClient>
    where
        F: Fn(JsonRpcRequest) -> Option<JsonRpcResponse> + Send + 'static,
    {
        let (ours, theirs) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let transport = Arc::new(StdioTransport::from_pipes("peer", reader, writer, EventSink::detached()));

        tokio::spawn(async move {
            let (peer_reader, mut peer_writer) = tokio::io::split(theirs);
            let mut lines = BufReader::new(peer_reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(JsonRpcMessage::Request(request)) = JsonRpcMessage::parse(&line) {
                    if let Some(response) = respond(request) {
                        let mut out = serde_json::to_string(&response).unwrap();
                        out.push('\n');
                        peer_writer.write_all(out.as_bytes()).await.unwrap();
                    }
                }
            }
        });

        RpcClient::connect("peer", transport, Duration::from_millis(300))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let client = client_with_peer(|req| Some(JsonRpcResponse::success(req.id, json!({"echo": req.method})))).await;
        let result = client.request("tools/list", None).await.unwrap();
        assert_eq!(result["echo"], "tools/list");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_downstream_error_preserved() {
        let client = client_with_peer(|req| {
            Some(JsonRpcResponse::failure(
                Some(req.id),
                JsonRpcError::new(-32000, "boom").with_data(json!("detail")),
            ))
        })
        .await;
        match client.call_tool("x", None).await {
            Err(ComposerError::Downstream(error)) => {
                assert_eq!(error.code, -32000);
                assert_eq!(error.data, Some(json!("detail")));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let client = client_with_peer(|_| None).await;
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ComposerError::Translation(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let client = client_with_peer(|req| {
            let page = match req.params.as_ref().and_then(|p| p.get("cursor")) {
                None => json!({"tools": [{"name": "a"}], "nextCursor": "2"}),
                Some(_) => json!({"tools": [{"name": "b"}]}),
            };
            Some(JsonRpcResponse::success(req.id, page))
        })
        .await;
        let names: Vec<String> = client.list_tools().await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let client = client_with_peer(|_| None).await;
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("slow", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.shutdown().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ComposerError::Cancelled)));
        assert!(!client.is_connected());
        assert!(matches!(
            client.request("x", None).await,
            Err(ComposerError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_request_ids_are_numbers() {
        let request = JsonRpcRequest::new(5_i64, "ping", None);
        assert_eq!(request.id, RequestId::Number(5));
    }
}
