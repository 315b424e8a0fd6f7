//! Streaming transport (server side): SSE feed per session, shared POST inbox.
//!
//! ```text
//!   GET  {sse_path}                      ──► event: endpoint  data: {message_path}?session_id=<id>
//!                                         ──► event: message   data: <JSON-RPC>   (repeated)
//!   POST {message_path}?session_id=<id>  ◄── one JSON-RPC message per body (202 Accepted)
//!   GET  /health                          ──► {"status":"ok","sessions":N}
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::{Envelope, InboundFeed, SessionId, Subscription, Transport, TransportKind};
use crate::error::{ComposerError, Result, TranslationError};
use crate::observer::{ComposerEvent, EventSink};
use crate::protocol::JsonRpcMessage;

/// Where and how the streaming endpoint is served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Listen address. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Path of the SSE feed.
    pub sse_path: String,
    /// Path of the POST submission point.
    pub message_path: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            sse_path: "/sse".to_string(),
            message_path: "/message".to_string(),
        }
    }
}

impl StreamingConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }
}

struct Hub {
    name: String,
    config: StreamingConfig,
    sessions: RwLock<HashMap<SessionId, mpsc::UnboundedSender<JsonRpcMessage>>>,
    inbound: mpsc::UnboundedSender<Envelope>,
    events: EventSink,
}

impl Hub {
    fn open_session(&self) -> (SessionId, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let session = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().insert(session, tx);
        info!(transport = %self.name, session = %session, "Streaming session opened");
        (session, rx)
    }

    fn close_session(&self, session: SessionId) {
        if self.sessions.write().remove(&session).is_some() {
            info!(transport = %self.name, session = %session, "Streaming session closed");
        }
    }

    fn send_to(&self, session: SessionId, message: JsonRpcMessage) -> Result<()> {
        let sessions = self.sessions.read();
        let tx = sessions
            .get(&session)
            .ok_or_else(|| TranslationError::UnknownSession(session.to_string()))?;
        tx.send(message)
            .map_err(|_| TranslationError::UnknownSession(session.to_string()).into())
    }

    fn broadcast(&self, message: JsonRpcMessage) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}

/// Removes its session from the hub when the SSE stream is dropped.
struct SessionGuard {
    hub: Arc<Hub>,
    session: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.close_session(self.session);
    }
}

#[derive(Default)]
struct Listener {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Streaming transport serving many concurrent client sessions.
pub struct StreamingTransport {
    hub: Arc<Hub>,
    feed: InboundFeed,
    listener: Mutex<Listener>,
    connected: AtomicBool,
}

impl StreamingTransport {
    pub fn new(name: impl Into<String>, config: StreamingConfig, events: EventSink) -> Self {
        let name = name.into();
        let (inbound, feed) = InboundFeed::new(name.clone());
        Self {
            hub: Arc::new(Hub {
                name,
                config,
                sessions: RwLock::new(HashMap::new()),
                inbound,
                events,
            }),
            feed,
            listener: Mutex::new(Listener::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// The HTTP router. `connect` serves it; tests drive it directly.
    pub fn router(&self) -> Router {
        let config = &self.hub.config;
        Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.message_path, post(message_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.hub))
    }

    /// Address actually bound, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().local_addr
    }

    /// Full URL of the SSE feed, once connected.
    pub fn sse_url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://{}{}", addr, self.hub.config.sse_path))
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.hub.sessions.read().keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.hub.sessions.read().len()
    }

    /// Send to one session.
    pub fn send_to(&self, session: SessionId, message: JsonRpcMessage) -> Result<()> {
        self.hub.send_to(session, message)
    }

    /// Send to every open session. Returns how many received it.
    pub fn broadcast(&self, message: JsonRpcMessage) -> usize {
        self.hub.broadcast(message)
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn name(&self) -> &str {
        &self.hub.name
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let bind = self.hub.config.bind;
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ComposerError::transport(format!("failed to bind {}: {}", bind, e)))?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let router = self.router();
        let name = self.hub.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(transport = %name, error = %e, "Streaming server stopped with error");
            }
        });

        let mut state = self.listener.lock();
        state.cancel = Some(cancel);
        state.task = Some(task);
        state.local_addr = Some(local_addr);
        self.connected.store(true, Ordering::SeqCst);

        info!(transport = %self.hub.name, addr = %local_addr, "Streaming endpoint listening");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let (cancel, task) = {
            let mut state = self.listener.lock();
            (state.cancel.take(), state.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        // Ending every session feed lets graceful shutdown finish.
        self.hub.sessions.write().clear();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(transport = %self.hub.name, "Streaming endpoint stopped");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        match envelope.session {
            Some(session) => self.hub.send_to(session, envelope.message),
            None => {
                self.hub.broadcast(envelope.message);
                Ok(())
            }
        }
    }

    async fn receive(&self) -> Result<Envelope> {
        self.feed.receive().await
    }

    fn subscribe(&self, cancel: CancellationToken) -> Result<Subscription> {
        self.feed.subscribe(cancel)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn has_session(&self, session: &SessionId) -> bool {
        self.hub.sessions.read().contains_key(session)
    }
}

async fn sse_handler(
    State(hub): State<Arc<Hub>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (session, mut rx) = hub.open_session();
    let endpoint = format!("{}?session_id={}", hub.config.message_path, session);
    let guard = SessionGuard { hub, session };

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default()
                .event("message")
                .json_data(&message)
                .unwrap_or_else(|_| Event::default()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Ok(session) = query.session_id.parse::<SessionId>() else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid session id"}))).into_response();
    };
    if !hub.sessions.read().contains_key(&session) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown session"}))).into_response();
    }

    let message = match serde_json::from_slice::<JsonRpcMessage>(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(transport = %hub.name, session = %session, error = %e, "Malformed submission");
            hub.events.emit(ComposerEvent::TranslationError {
                origin: format!("{}/{}", hub.name, session),
                detail: e.to_string(),
            });
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
        }
    };

    if hub.inbound.send(Envelope::for_session(Some(session), message)).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "not accepting messages"})))
            .into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

async fn health_handler(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "transport": hub.name,
        "sessions": hub.sessions.read().len(),
    }))
}
