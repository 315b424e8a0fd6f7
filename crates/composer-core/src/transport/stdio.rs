//! Newline-delimited JSON over a pair of byte pipes.
//!
//! Each message is one line terminated by `\n`. Lines that do not parse are
//! reported as translation errors and skipped; the transport stays open.
//! A child's stderr is read separately and surfaced as diagnostics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Envelope, InboundFeed, Subscription, Transport, TransportKind};
use crate::error::{ComposerError, Result};
use crate::observer::{ComposerEvent, EventSink};
use crate::protocol::JsonRpcMessage;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Pipes not yet handed to the reader tasks.
struct Unstarted {
    reader: BoxedReader,
    stderr: Option<BoxedReader>,
    inbound: mpsc::UnboundedSender<Envelope>,
}

/// Standard-stream transport.
pub struct StdioTransport {
    name: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    unstarted: Mutex<Option<Unstarted>>,
    feed: InboundFeed,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: EventSink,
}

impl StdioTransport {
    /// Take over a spawned child's stdin, stdout and stderr.
    pub fn from_child(name: impl Into<String>, child: &mut Child, events: EventSink) -> Result<Self> {
        let name = name.into();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ComposerError::process_start(&name, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ComposerError::process_start(&name, "stdout not captured"))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        Ok(Self::build(name, Box::new(stdout), Box::new(stdin), stderr, events))
    }

    /// Use this process's own stdin and stdout.
    pub fn from_host_stdio(name: impl Into<String>, events: EventSink) -> Self {
        Self::build(
            name.into(),
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
            None,
            events,
        )
    }

    /// Use an arbitrary pair of pipes.
    pub fn from_pipes<R, W>(name: impl Into<String>, reader: R, writer: W, events: EventSink) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(name.into(), Box::new(reader), Box::new(writer), None, events)
    }

    fn build(
        name: String,
        reader: BoxedReader,
        writer: BoxedWriter,
        stderr: Option<BoxedReader>,
        events: EventSink,
    ) -> Self {
        let (inbound, feed) = InboundFeed::new(name.clone());
        Self {
            name,
            writer: tokio::sync::Mutex::new(Some(writer)),
            unstarted: Mutex::new(Some(Unstarted {
                reader,
                stderr,
                inbound,
            })),
            feed,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Close the write side so the peer sees end-of-file.
    pub async fn close_input(&self) {
        if self.writer.lock().await.take().is_some() {
            debug!(transport = %self.name, "Closed stdin");
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let Some(unstarted) = self.unstarted.lock().take() else {
            if self.is_connected() {
                return Ok(());
            }
            return Err(ComposerError::transport(format!(
                "stdio transport '{}' cannot be reconnected",
                self.name
            )));
        };

        self.connected.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(read_messages(
            self.name.clone(),
            unstarted.reader,
            unstarted.inbound,
            self.events.clone(),
            Arc::clone(&self.connected),
            self.cancel.clone(),
        )));
        if let Some(stderr) = unstarted.stderr {
            tasks.push(tokio::spawn(read_diagnostics(
                self.name.clone(),
                stderr,
                self.events.clone(),
                self.cancel.clone(),
            )));
        }
        debug!(transport = %self.name, "Stdio transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.close_input().await;
        self.cancel.cancel();
        // Drop the pipes of a never-connected transport so the feed ends.
        self.unstarted.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!(transport = %self.name, "Stdio transport disconnected");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut line = serde_json::to_string(&envelope.message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ComposerError::ConnectionClosed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ComposerError::transport(format!("write to '{}' failed: {}", self.name, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ComposerError::transport(format!("flush to '{}' failed: {}", self.name, e)))?;

        trace!(transport = %self.name, message = %line.trim_end(), "Sent");
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

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_messages(
    name: String,
    reader: BoxedReader,
    inbound: mpsc::UnboundedSender<Envelope>,
    events: EventSink,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    // Partial reads survive a cancelled `read_until`, so the buffer is only
    // taken once a whole line is in.
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(transport = %name, "Peer closed its output");
                break;
            }
            Ok(_) => {
                let line = std::mem::take(&mut buf);
                let text = match std::str::from_utf8(&line) {
                    Ok(text) => text.trim(),
                    Err(e) => {
                        report_malformed(&name, &events, format!("line is not valid UTF-8: {}", e));
                        continue;
                    }
                };
                if text.is_empty() {
                    continue;
                }
                match JsonRpcMessage::parse(text) {
                    Ok(message) => {
                        trace!(transport = %name, message = %text, "Received");
                        if inbound.send(Envelope::new(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => report_malformed(&name, &events, e.to_string()),
                }
            }
            Err(e) => {
                warn!(transport = %name, error = %e, "Read failed");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

fn report_malformed(name: &str, events: &EventSink, detail: String) {
    warn!(transport = %name, error = %detail, "Skipping malformed line");
    events.emit(ComposerEvent::TranslationError {
        origin: name.to_string(),
        detail,
    });
}

async fn read_diagnostics(
    name: String,
    stderr: BoxedReader,
    events: EventSink,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                buf.clear();
                debug!(server = %name, stderr = %line, "Server stderr");
                events.emit(ComposerEvent::Diagnostic {
                    server: name.clone(),
                    line,
                });
            }
            Err(e) => {
                debug!(server = %name, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{MemoryObserver, spawn_dispatcher};
    use crate::protocol::{JsonRpcRequest, RequestId};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let (ours, mut theirs) = duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::from_pipes("t", reader, writer, EventSink::detached());
        transport.connect().await.unwrap();

        transport
            .send(Envelope::new(JsonRpcRequest::new(1_i64, "ping", None)))
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = theirs.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\"method\":\"ping\""));
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_close_transport() {
        let observer = Arc::new(MemoryObserver::new(16));
        let (events, _dispatcher) = spawn_dispatcher(vec![observer.clone()]);

        let (ours, mut theirs) = duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::from_pipes("t", reader, writer, events);
        transport.connect().await.unwrap();

        theirs
            .write_all(b"this is not json\n\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n")
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), transport.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message.id(), Some(&RequestId::Number(3)));
        assert!(transport.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            observer
                .snapshot()
                .iter()
                .any(|e| matches!(e, ComposerEvent::TranslationError { .. }))
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let observer = Arc::new(MemoryObserver::new(16));
        let (events, _dispatcher) = spawn_dispatcher(vec![observer.clone()]);

        let (ours, mut theirs) = duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::from_pipes("t", reader, writer, events);
        transport.connect().await.unwrap();

        theirs
            .write_all(b"\xff\xfe\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n")
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), transport.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message.id(), Some(&RequestId::Number(3)));
        assert!(transport.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(observer.snapshot().iter().any(|e| matches!(
            e,
            ComposerEvent::TranslationError { detail, .. } if detail.contains("UTF-8")
        )));
    }

    #[tokio::test]
    async fn test_stderr_keeps_draining_after_invalid_utf8() {
        let observer = Arc::new(MemoryObserver::new(16));
        let (events, _dispatcher) = spawn_dispatcher(vec![observer.clone()]);

        let (stderr_ours, mut stderr_theirs) = duplex(4096);
        let (ours, _theirs) = duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::build(
            "t".to_string(),
            Box::new(reader),
            Box::new(writer),
            Some(Box::new(stderr_ours)),
            events,
        );
        transport.connect().await.unwrap();

        stderr_theirs.write_all(b"bad \xff byte\nstill here\n").await.unwrap();

        let diagnostics = || -> Vec<String> {
            observer
                .snapshot()
                .into_iter()
                .filter_map(|e| match e {
                    ComposerEvent::Diagnostic { line, .. } => Some(line),
                    _ => None,
                })
                .collect()
        };
        for _ in 0..40 {
            if diagnostics().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let lines = diagnostics();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("bad "));
        assert_eq!(lines[1], "still here");
    }

    #[tokio::test]
    async fn test_peer_eof_ends_feed() {
        let (ours, theirs) = duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::from_pipes("t", reader, writer, EventSink::detached());
        transport.connect().await.unwrap();

        let mut subscription = transport.subscribe(CancellationToken::new()).unwrap();
        drop(theirs);
        let next = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (ours, _theirs) = duplex(64);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StdioTransport::from_pipes("t", reader, writer, EventSink::detached());
        transport.connect().await.unwrap();
        transport.disconnect().await.unwrap();

        let err = transport
            .send(Envelope::new(JsonRpcRequest::new(1_i64, "ping", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::ConnectionClosed));
        assert!(transport.connect().await.is_err());
    }
}
