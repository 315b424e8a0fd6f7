//! Streaming transport (client side).
//!
//! Opens the remote SSE feed, waits for the `endpoint` event announcing the
//! submission URL, then posts outbound messages there. Inbound `message`
//! events form the receive feed.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{Envelope, InboundFeed, Subscription, Transport, TransportKind};
use crate::error::{ComposerError, Result};
use crate::observer::{ComposerEvent, EventSink};
use crate::protocol::JsonRpcMessage;

type EventStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

/// Client for a remote streaming endpoint.
pub struct RemoteTransport {
    name: String,
    url: Url,
    headers: BTreeMap<String, String>,
    connect_timeout: Duration,
    client: reqwest::Client,
    feed: InboundFeed,
    inbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    message_url: RwLock<Option<Url>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    events: EventSink,
}

impl RemoteTransport {
    /// Create a transport for the SSE feed at `url`.
    pub fn new(name: impl Into<String>, url: &str, events: EventSink) -> Result<Self> {
        let name = name.into();
        let url = Url::parse(url)
            .map_err(|e| ComposerError::config(format!("invalid URL '{}': {}", url, e)))?;
        let (inbound, feed) = InboundFeed::new(name.clone());
        Ok(Self {
            name,
            url,
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            client: reqwest::Client::new(),
            feed,
            inbound: Mutex::new(Some(inbound)),
            message_url: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            events,
        })
    }

    /// Extra headers sent on every request.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// How long to wait for the `endpoint` event.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The URL messages are posted to, once connected.
    pub fn message_url(&self) -> Option<Url> {
        self.message_url.read().clone()
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request
    }

    async fn open_feed(&self) -> Result<(EventStream, Url)> {
        let request = self
            .apply_headers(self.client.get(self.url.clone()))
            .header("Accept", "text/event-stream");
        let response = request
            .send()
            .await
            .map_err(|e| ComposerError::transport(format!("GET {} failed: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(ComposerError::transport(format!(
                "GET {} returned {}",
                self.url,
                response.status()
            )));
        }

        let mut events: EventStream = Box::pin(response.bytes_stream().eventsource());
        while let Some(event) = events.next().await {
            let event =
                event.map_err(|e| ComposerError::transport(format!("SSE stream error: {}", e)))?;
            if event.event == "endpoint" {
                let endpoint = self.url.join(event.data.trim()).map_err(|e| {
                    ComposerError::transport(format!("bad endpoint '{}': {}", event.data, e))
                })?;
                return Ok((events, endpoint));
            }
            trace!(transport = %self.name, event = %event.event, "Ignoring event before endpoint");
        }
        Err(ComposerError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let Some(inbound) = self.inbound.lock().take() else {
            return Err(ComposerError::transport(format!(
                "remote transport '{}' cannot be reconnected",
                self.name
            )));
        };

        let opened = match tokio::time::timeout(self.connect_timeout, self.open_feed()).await {
            Ok(opened) => opened,
            Err(_) => Err(ComposerError::timeout(
                format!("connect to {}", self.url),
                self.connect_timeout,
            )),
        };
        let (events, endpoint) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                *self.inbound.lock() = Some(inbound);
                return Err(e);
            }
        };

        info!(transport = %self.name, url = %self.url, endpoint = %endpoint, "Connected to streaming endpoint");
        *self.message_url.write() = Some(endpoint);
        self.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_events(
            self.name.clone(),
            events,
            inbound,
            self.events.clone(),
            Arc::clone(&self.connected),
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.inbound.lock().take();
        self.message_url.write().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(transport = %self.name, "Remote transport disconnected");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let url = self.message_url().ok_or(ComposerError::ConnectionClosed)?;
        let response = self
            .apply_headers(self.client.post(url.clone()))
            .json(&envelope.message)
            .send()
            .await
            .map_err(|e| ComposerError::transport(format!("POST {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ComposerError::transport(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        trace!(transport = %self.name, "Posted message");
        Ok(())
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
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_events(
    name: String,
    mut events: EventStream,
    inbound: mpsc::UnboundedSender<Envelope>,
    sink: EventSink,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if !(event.event.is_empty() || event.event == "message") || event.data.is_empty() {
                    continue;
                }
                match JsonRpcMessage::parse(&event.data) {
                    Ok(message) => {
                        if inbound.send(Envelope::new(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(transport = %name, error = %e, "Skipping malformed event");
                        sink.emit(ComposerEvent::TranslationError {
                            origin: name.clone(),
                            detail: e.to_string(),
                        });
                    }
                }
            }
            Some(Err(e)) => {
                warn!(transport = %name, error = %e, "Streaming feed failed");
                break;
            }
            None => {
                debug!(transport = %name, "Streaming feed ended");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
