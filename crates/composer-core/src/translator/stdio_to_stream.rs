//! Relay a stdio caller to a remote streaming server.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StdioToStreamConfig, TranslatorShared};
use crate::error::{ComposerError, Result, TranslationError};
use crate::lifecycle::LifecycleState;
use crate::observer::ComposerEvent;
use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
use crate::transport::{Envelope, RemoteTransport, StdioTransport, Transport};

/// There is exactly one caller, so requests keep the caller's own ids and
/// the pending table is keyed by them.
pub(crate) struct StdioToStream {
    shared: Arc<TranslatorShared>,
    caller: Arc<StdioTransport>,
    remote: Arc<RemoteTransport>,
}

impl StdioToStream {
    pub(crate) async fn start(
        shared: Arc<TranslatorShared>,
        config: &StdioToStreamConfig,
        caller: StdioTransport,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let remote = RemoteTransport::new(&config.name, &config.url, shared.events.clone())?
            .with_headers(config.headers.clone())
            .with_connect_timeout(connect_timeout);
        remote.connect().await?;
        info!(translator = %config.name, url = %config.url, "Connected to remote streaming server");
        shared.set_endpoint(config.url.clone());

        let caller = Arc::new(caller);
        if let Err(e) = caller.connect().await {
            let _ = remote.disconnect().await;
            return Err(e);
        }

        Ok(Self {
            shared,
            caller,
            remote: Arc::new(remote),
        })
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        let subscriptions = (
            self.caller.subscribe(cancel.child_token()),
            self.remote.subscribe(cancel.child_token()),
        );
        let (mut from_caller, mut from_remote) = match subscriptions {
            (Ok(caller), Ok(remote)) => (caller, remote),
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
                envelope = from_remote.next() => match envelope {
                    Some(envelope) => self.on_remote_message(envelope).await,
                    None => {
                        warn!(translator = %self.shared.name, "Remote server closed the stream");
                        break LifecycleState::Crashed;
                    }
                },
                envelope = from_caller.next() => match envelope {
                    Some(envelope) => self.on_caller_message(envelope, &mut waiters, &waiter_cancel).await,
                    None => {
                        info!(translator = %self.shared.name, "Caller closed its input");
                        break LifecycleState::Stopped;
                    }
                },
                Some(_) = waiters.join_next(), if !waiters.is_empty() => {}
            }
        };

        self.teardown(waiters, &cancel).await;
        self.shared.finish(outcome);
    }

    async fn on_caller_message(
        &self,
        envelope: Envelope,
        waiters: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        match envelope.message {
            JsonRpcMessage::Request(request) => {
                let id = request.id.clone();
                let handle = match self.shared.pending.register(id.clone()) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(translator = %self.shared.name, id = %id, "Duplicate in-flight request id");
                        self.shared.events.emit(ComposerEvent::TranslationError {
                            origin: self.shared.name.clone(),
                            detail: e.to_string(),
                        });
                        self.answer(JsonRpcResponse::failure(Some(id), e.to_rpc_error()))
                            .await;
                        return;
                    }
                };
                if let Err(e) = self.remote.send(Envelope::new(request)).await {
                    drop(handle);
                    self.answer(JsonRpcResponse::failure(Some(id), e.to_rpc_error()))
                        .await;
                    return;
                }

                let shared = Arc::clone(&self.shared);
                let caller = Arc::clone(&self.caller);
                let cancel = cancel.clone();
                waiters.spawn(async move {
                    let response = match handle.wait(shared.request_timeout, &cancel).await {
                        Ok(response) => response,
                        Err(e) => {
                            if let ComposerError::Translation(TranslationError::Timeout { .. }) = &e {
                                warn!(translator = %shared.name, id = %id, "Request timed out");
                                shared.events.emit(ComposerEvent::TranslationError {
                                    origin: shared.name.clone(),
                                    detail: e.to_string(),
                                });
                            }
                            JsonRpcResponse::failure(Some(id), e.to_rpc_error())
                        }
                    };
                    if let Err(e) = caller.send(Envelope::new(response)).await {
                        debug!(translator = %shared.name, error = %e, "Caller gone before its response");
                    }
                });
            }
            message => {
                if let Err(e) = self.remote.send(Envelope::new(message)).await {
                    debug!(translator = %self.shared.name, error = %e, "Failed to forward to remote server");
                }
            }
        }
    }

    async fn on_remote_message(&self, envelope: Envelope) {
        match envelope.message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !self.shared.pending.resolve(response) {
                    debug!(translator = %self.shared.name, id = ?id, "Dropping uncorrelated response");
                }
            }
            message => {
                if let Err(e) = self.caller.send(Envelope::new(message)).await {
                    debug!(translator = %self.shared.name, error = %e, "Failed to forward to caller");
                }
            }
        }
    }

    async fn answer(&self, response: JsonRpcResponse) {
        if let Err(e) = self.caller.send(Envelope::new(response)).await {
            debug!(translator = %self.shared.name, error = %e, "Failed to answer caller");
        }
    }

    async fn teardown(&self, mut waiters: JoinSet<()>, cancel: &CancellationToken) {
        let cancelled = self.shared.pending.cancel_all();
        if cancelled > 0 {
            debug!(translator = %self.shared.name, cancelled, "Cancelled pending requests");
        }
        while waiters.join_next().await.is_some() {}
        cancel.cancel();

        if let Err(e) = self.remote.disconnect().await {
            debug!(translator = %self.shared.name, error = %e, "Remote disconnect failed");
        }
        if let Err(e) = self.caller.disconnect().await {
            debug!(translator = %self.shared.name, error = %e, "Caller disconnect failed");
        }
    }
}
