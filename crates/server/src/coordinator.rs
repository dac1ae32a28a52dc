//! Per-session transfer coordinator.
//!
//! Each session runs as its own task. The task's mailbox is the set of
//! bus subscriptions for the session's client-facing channels; it pulls
//! one chunk at a time, feeds the sink, and publishes a single `done`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use slicepull_bus::{Bus, Subscription};
use slicepull_protocol::{
    CancelRequest, ChunkRequest, ChunkResponse, DoneEvent, Message, MessageType, channel,
};
use slicepull_transfer::{ResponseOutcome, ResultSink, Session, StartOutcome, TransferError};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;
use crate::{ServerConfig, ServerError};

/// Subscriptions a coordinator listens on.
pub(crate) struct Mailbox {
    start: Subscription,
    response: Subscription,
    cancel: Subscription,
}

impl Mailbox {
    /// Subscribes to the client-facing channels of `session_id`.
    ///
    /// Must happen before the id is handed to the client so no message
    /// is published into the void.
    pub(crate) fn open(bus: &dyn Bus, session_id: &str) -> Self {
        Self {
            start: bus.subscribe(&channel::start(session_id)),
            response: bus.subscribe(&channel::response(session_id)),
            cancel: bus.subscribe(&channel::cancel(session_id)),
        }
    }
}

/// Why a session ended without reaching its last byte.
#[derive(Debug, thiserror::Error)]
enum Abort {
    #[error("no progress for {0:?}")]
    IdleTimeout(Duration),

    #[error("cancelled by client: {0}")]
    Cancelled(String),

    #[error("server shutting down")]
    Shutdown,

    #[error("{0} protocol violations")]
    TooManyViolations(u32),

    #[error("sink rejected chunk: {0}")]
    Sink(TransferError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("session mailbox closed")]
    Disconnected,
}

/// Drives one session from `start` to `done`.
pub(crate) struct TransferCoordinator {
    session: Arc<Session>,
    sink: Box<dyn ResultSink>,
    bus: Arc<dyn Bus>,
    registry: SessionRegistry,
    config: ServerConfig,
    mailbox: Mailbox,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    pub(crate) fn new(
        session: Arc<Session>,
        sink: Box<dyn ResultSink>,
        bus: Arc<dyn Bus>,
        registry: SessionRegistry,
        config: ServerConfig,
        mailbox: Mailbox,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            sink,
            bus,
            registry,
            config,
            mailbox,
            cancel,
        }
    }

    /// Runs the session to completion, then lingers for the grace
    /// period and unregisters it.
    pub(crate) async fn run(mut self) {
        let id = self.session.id().clone();

        let success = match self.drive().await {
            Ok(()) => {
                let verdict = self.sink.finalize();
                if !verdict {
                    tracing::warn!(session = %id, "sink rejected the transferred file");
                }
                verdict
            }
            Err(abort) => {
                tracing::warn!(
                    session = %id,
                    delivered = self.session.bytes_delivered(),
                    declared = self.session.declared_size(),
                    idle = ?self.session.idle_for(),
                    "transfer failed: {abort}"
                );
                self.sink.fail(&abort.to_string());
                false
            }
        };

        self.session.finish(success);
        tracing::info!(
            session = %id,
            name = self.session.name(),
            success,
            bytes = self.session.bytes_delivered(),
            "session done"
        );
        self.publish_done(success);

        self.linger(success).await;
        self.registry.remove(&id).await;
    }

    /// Chunking loop. Returns once every declared byte has been accepted.
    async fn drive(&mut self) -> Result<(), Abort> {
        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Abort::Shutdown),

                _ = sleep_until(deadline) => return Err(Abort::IdleTimeout(idle)),

                msg = self.mailbox.start.recv() => {
                    msg.ok_or(Abort::Disconnected)?;
                    match self.session.start() {
                        StartOutcome::Started => {
                            tracing::info!(
                                session = %self.session.id(),
                                size = self.session.declared_size(),
                                "session started"
                            );
                            self.session.touch();
                            deadline = Instant::now() + idle;
                            if self.request_next()? {
                                return Ok(());
                            }
                        }
                        StartOutcome::AlreadyStarted => {
                            tracing::debug!(session = %self.session.id(), "duplicate start ignored");
                        }
                    }
                }

                msg = self.mailbox.response.recv() => {
                    let msg = msg.ok_or(Abort::Disconnected)?;
                    if self.on_response(&msg)? {
                        self.session.touch();
                        deadline = Instant::now() + idle;
                        if self.request_next()? {
                            return Ok(());
                        }
                    }
                }

                msg = self.mailbox.cancel.recv() => {
                    let msg = msg.ok_or(Abort::Disconnected)?;
                    let reason = msg
                        .payload_as::<CancelRequest>(MessageType::Cancel)
                        .map(|c| c.reason)
                        .unwrap_or_default();
                    return Err(Abort::Cancelled(reason));
                }
            }
        }
    }

    /// Publishes the next chunk request. Returns `true` when nothing is
    /// left to pull.
    fn request_next(&mut self) -> Result<bool, Abort> {
        let Some(range) = self.session.next_request(self.config.chunk_size)? else {
            return Ok(true);
        };
        tracing::trace!(
            session = %self.session.id(),
            offset = range.offset,
            size = range.size,
            "requesting chunk"
        );
        let req = ChunkRequest {
            offset: range.offset,
            size: range.size,
        };
        self.publish(
            &channel::request(self.session.id().as_str()),
            MessageType::ChunkRequest,
            Some(&req),
        )?;
        Ok(false)
    }

    /// Handles one chunk response. Returns `true` when it advanced the
    /// session.
    fn on_response(&mut self, msg: &Message) -> Result<bool, Abort> {
        let resp = match msg.payload_as::<ChunkResponse>(MessageType::ChunkResponse) {
            Ok(resp) => resp,
            Err(e) => {
                self.violation(&e)?;
                return Ok(false);
            }
        };

        let data = match resp.decode() {
            Ok(data) => data,
            Err(e) => {
                self.violation(&e)?;
                return Ok(false);
            }
        };

        match self
            .session
            .accept_response(resp.offset, resp.size, data.len() as u64)
        {
            Ok(ResponseOutcome::Advanced {
                delivered,
                complete,
            }) => {
                self.sink.accept(resp.offset, &data).map_err(Abort::Sink)?;
                tracing::debug!(
                    session = %self.session.id(),
                    offset = resp.offset,
                    size = resp.size,
                    delivered,
                    complete,
                    "chunk accepted"
                );
                Ok(true)
            }
            Ok(ResponseOutcome::Stale) => {
                tracing::debug!(
                    session = %self.session.id(),
                    offset = resp.offset,
                    size = resp.size,
                    "stale chunk response discarded"
                );
                Ok(false)
            }
            Err(e) if !e.is_fatal() => {
                self.violation(&e)?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Counts a malformed message; fails the session once the budget is
    /// exceeded.
    fn violation(&self, err: &dyn fmt::Display) -> Result<(), Abort> {
        let count = self.session.record_violation();
        tracing::warn!(session = %self.session.id(), count, "protocol violation: {err}");
        if count > self.config.max_violations {
            return Err(Abort::TooManyViolations(count));
        }
        Ok(())
    }

    /// Keeps answering a redelivered start with the same verdict until
    /// the grace period ends.
    async fn linger(&mut self, success: bool) {
        let until = Instant::now() + self.config.done_grace;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(until) => break,
                msg = self.mailbox.start.recv() => {
                    if msg.is_none() {
                        break;
                    }
                    tracing::debug!(session = %self.session.id(), "start after done, repeating verdict");
                    self.publish_done(success);
                }
                Some(_) = self.mailbox.response.recv() => {}
                Some(_) = self.mailbox.cancel.recv() => {}
            }
        }
    }

    fn publish_done(&self, success: bool) {
        let result = self.publish(
            &channel::done(self.session.id().as_str()),
            MessageType::Done,
            Some(&DoneEvent { success }),
        );
        if let Err(e) = result {
            tracing::error!(session = %self.session.id(), "failed to publish done: {e}");
        }
    }

    fn publish<T: Serialize>(
        &self,
        channel: &str,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), ServerError> {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)?;
        self.bus.publish(channel, msg)?;
        Ok(())
    }
}
