//! Serve a stdio server to streaming clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StreamToStdioConfig, TranslatorShared};
use crate::error::{ComposerError, Result, TranslationError};
use crate::lifecycle::LifecycleState;
use crate::observer::ComposerEvent;
use crate::process::stop_child;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::transport::{Envelope, StdioTransport, StreamingTransport, Transport};

/// Owns the child; requests from every session share its stdin, so each
/// forwarded id is rewritten to a unique internal number.
pub(crate) struct StreamToStdio {
    shared: Arc<TranslatorShared>,
    child: Child,
    upstream: Arc<StdioTransport>,
    downstream: Arc<StreamingTransport>,
    stop_grace: Duration,
    next_id: i64,
}

impl StreamToStdio {
    pub(crate) async fn start(
        shared: Arc<TranslatorShared>,
        config: &StreamToStdioConfig,
        stop_grace: Duration,
    ) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|e| ComposerError::process_start(&config.name, e))?;

        let upstream = Arc::new(StdioTransport::from_child(
            &config.name,
            &mut child,
            shared.events.clone(),
        )?);
        upstream.connect().await?;

        let downstream = Arc::new(StreamingTransport::new(
            &config.name,
            config.streaming.clone(),
            shared.events.clone(),
        ));
        if let Err(e) = downstream.connect().await {
            let _ = upstream.disconnect().await;
            return Err(e);
        }
        if let Some(url) = downstream.sse_url() {
            info!(translator = %config.name, url = %url, pid = ?child.id(), "Serving stdio server over streaming");
            shared.set_endpoint(url);
        }

        Ok(Self {
            shared,
            child,
            upstream,
            downstream,
            stop_grace,
            next_id: 1,
        })
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let subscriptions = (
            self.downstream.subscribe(cancel.child_token()),
            self.upstream.subscribe(cancel.child_token()),
        );
        let (mut from_clients, mut from_server) = match subscriptions {
            (Ok(clients), Ok(server)) => (clients, server),
            (Err(e), _) | (_, Err(e)) => {
                warn!(translator = %self.shared.name, error = %e, "Failed to subscribe");
                self.teardown(JoinSet::new(), &cancel).await;
                self.shared.transition(LifecycleState::Crashed);
                return;
            }
        };

        self.shared.transition(LifecycleState::Running);
        let waiter_cancel = cancel.child_token();
        let mut waiters = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break LifecycleState::Stopped,
                status = self.child.wait() => {
                    warn!(translator = %self.shared.name, status = ?status.ok(), "Stdio server exited");
                    break LifecycleState::Crashed;
                }
                envelope = from_server.next() => match envelope {
                    Some(envelope) => self.on_server_message(envelope),
                    None => {
                        warn!(translator = %self.shared.name, "Stdio server closed its output");
                        break LifecycleState::Crashed;
                    }
                },
                envelope = from_clients.next() => match envelope {
                    Some(envelope) => self.on_client_message(envelope, &mut waiters, &waiter_cancel).await,
                    None => break LifecycleState::Stopped,
                },
                Some(_) = waiters.join_next(), if !waiters.is_empty() => {}
            }
        };

        self.teardown(waiters, &cancel).await;
        self.shared.finish(outcome);
    }

    async fn on_client_message(
        &mut self,
        envelope: Envelope,
        waiters: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let session = envelope.session;
        match envelope.message {
            JsonRpcMessage::Request(request) => {
                let original = request.id.clone();
                let internal = RequestId::Number(self.next_id);
                self.next_id += 1;

                let handle = match self.shared.pending.register(internal.clone()) {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.reply(session, JsonRpcResponse::failure(Some(original), e.to_rpc_error()));
                        return;
                    }
                };
                let forwarded = JsonRpcRequest {
                    id: internal,
                    ..request
                };
                if let Err(e) = self.upstream.send(Envelope::new(forwarded)).await {
                    // Dropping the handle removes the entry.
                    drop(handle);
                    self.reply(session, JsonRpcResponse::failure(Some(original), e.to_rpc_error()));
                    return;
                }

                let shared = Arc::clone(&self.shared);
                let downstream = Arc::clone(&self.downstream);
                let cancel = cancel.clone();
                waiters.spawn(async move {
                    let response = match handle.wait(shared.request_timeout, &cancel).await {
                        Ok(mut response) => {
                            response.id = Some(original);
                            response
                        }
                        Err(e) => {
                            if let ComposerError::Translation(TranslationError::Timeout { .. }) = &e {
                                warn!(translator = %shared.name, id = %original, "Request timed out");
                                shared.events.emit(ComposerEvent::TranslationError {
                                    origin: shared.name.clone(),
                                    detail: e.to_string(),
                                });
                            }
                            JsonRpcResponse::failure(Some(original), e.to_rpc_error())
                        }
                    };
                    if let Err(e) = downstream.send(Envelope::for_session(session, response)).await {
                        debug!(translator = %shared.name, error = %e, "Session gone before its response");
                    }
                });
            }
            message => {
                if let Err(e) = self.upstream.send(Envelope::new(message)).await {
                    debug!(translator = %self.shared.name, error = %e, "Failed to forward to stdio server");
                }
            }
        }
    }

    fn on_server_message(&self, envelope: Envelope) {
        match envelope.message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !self.shared.pending.resolve(response) {
                    debug!(translator = %self.shared.name, id = ?id, "Dropping uncorrelated response");
                }
            }
            message => {
                self.downstream.broadcast(message);
            }
        }
    }

    fn reply(&self, session: Option<crate::transport::SessionId>, response: JsonRpcResponse) {
        let result = match session {
            Some(session) => self.downstream.send_to(session, response.into()),
            None => {
                self.downstream.broadcast(response.into());
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(translator = %self.shared.name, error = %e, "Failed to reply");
        }
    }

    /// Answer every pending caller, then release the endpoint and the child.
    async fn teardown(&mut self, mut waiters: JoinSet<()>, cancel: &CancellationToken) {
        let cancelled = self.shared.pending.cancel_all();
        if cancelled > 0 {
            debug!(translator = %self.shared.name, cancelled, "Cancelled pending requests");
        }
        while waiters.join_next().await.is_some() {}
        cancel.cancel();

        if let Err(e) = self.downstream.disconnect().await {
            debug!(translator = %self.shared.name, error = %e, "Endpoint shutdown failed");
        }
        if let Err(e) = self.upstream.disconnect().await {
            debug!(translator = %self.shared.name, error = %e, "Stdio disconnect failed");
        }
        match stop_child(&self.shared.name, &mut self.child, self.stop_grace).await {
            Ok(status) => debug!(translator = %self.shared.name, code = ?status.code(), "Stdio server released"),
            Err(e) => warn!(translator = %self.shared.name, error = %e, "Failed to release stdio server"),
        }
    }
}
