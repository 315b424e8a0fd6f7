//! Transports carrying JSON-RPC messages.
//!
//! - [`stdio::StdioTransport`]: newline-delimited JSON over a child's (or the
//!   host's) stdin/stdout, stderr captured as diagnostics.
//! - [`streaming::StreamingTransport`]: SSE server multiplexing many client
//!   sessions behind one POST submission point.
//! - [`remote::RemoteTransport`]: SSE client for a remotely hosted streaming
//!   server.
//!
//! Every transport exposes its inbound messages as a single-consumer feed:
//! [`Transport::receive`] borrows it for one message, a [`Subscription`]
//! borrows it until dropped or cancelled.

pub mod remote;
pub mod stdio;
pub mod streaming;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ComposerError, Result};
use crate::protocol::JsonRpcMessage;

pub use remote::RemoteTransport;
pub use stdio::StdioTransport;
pub use streaming::{StreamingConfig, StreamingTransport};

/// Transport style of a server or endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Streaming,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Streaming => f.write_str("streaming"),
        }
    }
}

/// Identifier of one streaming client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// A message plus the streaming session it belongs to.
///
/// Stdio transports ignore `session`; a streaming server routes outbound
/// envelopes to their session, or broadcasts when it is `None`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session: Option<SessionId>,
    pub message: JsonRpcMessage,
}

impl Envelope {
    pub fn new(message: impl Into<JsonRpcMessage>) -> Self {
        Self {
            session: None,
            message: message.into(),
        }
    }

    pub fn for_session(session: Option<SessionId>, message: impl Into<JsonRpcMessage>) -> Self {
        Self {
            session,
            message: message.into(),
        }
    }
}

/// Connection to a peer that exchanges JSON-RPC messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport style.
    fn kind(&self) -> TransportKind;

    /// Name used in logs and events.
    fn name(&self) -> &str;

    /// Establish the connection. A no-op when already connected.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down. Inbound consumers observe the end of the feed.
    async fn disconnect(&self) -> Result<()>;

    /// Send one message.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Wait for the next inbound message.
    async fn receive(&self) -> Result<Envelope>;

    /// Borrow the inbound feed until the subscription is dropped or `cancel` fires.
    fn subscribe(&self, cancel: CancellationToken) -> Result<Subscription>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Whether replies can still reach `session`. Single-peer transports
    /// have no sessions and always answer `true`.
    fn has_session(&self, _session: &SessionId) -> bool {
        true
    }
}

type FeedSlot = Arc<Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>>;

/// Single-consumer inbound message feed shared by the transports.
#[derive(Debug)]
pub(crate) struct InboundFeed {
    name: String,
    slot: FeedSlot,
}

impl InboundFeed {
    pub(crate) fn new(name: impl Into<String>) -> (mpsc::UnboundedSender<Envelope>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            name: name.into(),
            slot: Arc::new(Mutex::new(Some(rx))),
        };
        (tx, feed)
    }

    fn lease(&self) -> Result<FeedLease> {
        let rx = self.slot.lock().take().ok_or_else(|| {
            ComposerError::transport(format!(
                "inbound feed of '{}' already has a consumer",
                self.name
            ))
        })?;
        Ok(FeedLease {
            rx: Some(rx),
            slot: Arc::clone(&self.slot),
        })
    }

    pub(crate) async fn receive(&self) -> Result<Envelope> {
        let mut lease = self.lease()?;
        lease.recv().await.ok_or(ComposerError::ConnectionClosed)
    }

    pub(crate) fn subscribe(&self, cancel: CancellationToken) -> Result<Subscription> {
        Ok(Subscription {
            lease: self.lease()?,
            cancel,
            done: false,
        })
    }
}

/// Borrowed receiver, handed back to the feed on drop.
#[derive(Debug)]
struct FeedLease {
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    slot: FeedSlot,
}

impl FeedLease {
    async fn recv(&mut self) -> Option<Envelope> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.slot.lock() = Some(rx);
        }
    }
}

/// Lazy, cancellable stream of inbound messages.
///
/// Ends when the transport closes or the cancellation token fires; once ended
/// it stays ended.
#[derive(Debug)]
pub struct Subscription {
    lease: FeedLease,
    cancel: CancellationToken,
    done: bool,
}

impl Subscription {
    /// Next inbound message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Envelope> {
        if self.done {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            message = self.lease.recv() => message,
        };
        if next.is_none() {
            self.done = true;
        }
        next
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|envelope| (envelope, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use futures::StreamExt;

    fn note(method: &str) -> Envelope {
        Envelope::new(JsonRpcNotification::new(method, None))
    }

    #[tokio::test]
    async fn test_feed_has_single_consumer() {
        let (_tx, feed) = InboundFeed::new("t");
        let subscription = feed.subscribe(CancellationToken::new()).unwrap();
        assert!(feed.subscribe(CancellationToken::new()).is_err());
        drop(subscription);
        assert!(feed.subscribe(CancellationToken::new()).is_ok());
    }

    #[tokio::test]
    async fn test_subscription_preserves_order() {
        let (tx, feed) = InboundFeed::new("t");
        for method in ["a", "b", "c"] {
            tx.send(note(method)).unwrap();
        }
        drop(tx);

        let methods: Vec<String> = feed
            .subscribe(CancellationToken::new())
            .unwrap()
            .into_stream()
            .map(|e| e.message.method().unwrap_or_default().to_string())
            .collect()
            .await;
        assert_eq!(methods, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_ends() {
        let (_tx, feed) = InboundFeed::new("t");
        let cancel = CancellationToken::new();
        let mut subscription = feed.subscribe(cancel.clone()).unwrap();
        cancel.cancel();
        assert!(subscription.next().await.is_none());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_receive_after_close() {
        let (tx, feed) = InboundFeed::new("t");
        tx.send(note("x")).unwrap();
        drop(tx);
        assert!(feed.receive().await.is_ok());
        assert!(matches!(
            feed.receive().await,
            Err(ComposerError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<SessionId>().is_err());
    }
}
