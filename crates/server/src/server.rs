//! Ingest server: answers create requests and spawns coordinators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use slicepull_bus::{Bus, Subscription};
use slicepull_protocol::constants::{
    CREATE_CHANNEL, ERR_CODE_BAD_REQUEST, ERR_CODE_CONFLICT, ERR_CODE_INTERNAL,
};
use slicepull_protocol::{CreateSessionRequest, Message, MessageType, SessionCreated, channel};
use slicepull_transfer::{SessionId, SinkFactory, TransferError, validate_name};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{Mailbox, TransferCoordinator};
use crate::registry::SessionRegistry;
use crate::{ServerConfig, ServerError};

/// Accepts sessions on the create channel and runs one coordinator per
/// session.
pub struct IngestServer {
    config: ServerConfig,
    bus: Arc<dyn Bus>,
    sinks: Arc<dyn SinkFactory>,
    registry: SessionRegistry,
    cancel: CancellationToken,
    /// Taken by [`IngestServer::run`]; subscribed up front so create
    /// requests published before `run` is polled are not lost.
    requests: Mutex<Option<Subscription>>,
    /// Correlation id of each accepted create, until its session is gone.
    accepted: Mutex<HashMap<String, SessionId>>,
}

impl IngestServer {
    pub fn new(
        config: ServerConfig,
        bus: Arc<dyn Bus>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Arc<Self> {
        let requests = bus.subscribe(CREATE_CHANNEL);
        Arc::new(Self {
            config,
            bus,
            sinks,
            registry: SessionRegistry::new(),
            cancel: CancellationToken::new(),
            requests: Mutex::new(Some(requests)),
            accepted: Mutex::new(HashMap::new()),
        })
    }

    /// Live sessions, including those still inside their grace period.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stops accepting sessions and fails every open one.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Serves create requests until [`shutdown`](Self::shutdown).
    ///
    /// Returns after every coordinator has published its verdict.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        tracing::info!(
            chunk_size = self.config.chunk_size,
            idle_timeout = ?self.config.idle_timeout,
            "ingest server listening on {CREATE_CHANNEL}"
        );

        let mut coordinators = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(open = coordinators.len(), "ingest server shutting down");
                    for snap in self.registry.snapshots().await {
                        tracing::info!(
                            session = %snap.session_id,
                            name = %snap.name,
                            phase = ?snap.phase,
                            "{:.1}% delivered at shutdown",
                            snap.percentage()
                        );
                    }
                    break;
                }

                msg = requests.recv() => {
                    let Some(msg) = msg else {
                        tracing::warn!("create channel closed");
                        break;
                    };
                    let correlation = msg.id.clone();
                    if let Some(coordinator) = self.handle_create(msg).await {
                        coordinators.spawn(async move {
                            coordinator.run().await;
                            correlation
                        });
                    }
                }

                Some(joined) = coordinators.join_next() => self.reap(joined),
            }
        }

        self.cancel.cancel();
        while let Some(joined) = coordinators.join_next().await {
            self.reap(joined);
        }
        let leftover = self.registry.ids().await;
        if !leftover.is_empty() {
            tracing::warn!(?leftover, "sessions still registered after shutdown");
        }
        Ok(())
    }

    /// Forgets the create behind a finished coordinator.
    fn reap(&self, joined: Result<String, tokio::task::JoinError>) {
        match joined {
            Ok(correlation) => {
                self.accepted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&correlation);
            }
            Err(e) => tracing::error!("coordinator task failed: {e}"),
        }
    }

    /// Session already created for `correlation`, if it is still live.
    async fn accepted_session(&self, correlation: &str) -> Option<SessionId> {
        let id = self
            .accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation)
            .cloned()?;
        self.registry.lookup(&id).await.map(|_| id)
    }

    /// Validates a create request, registers the session and replies.
    ///
    /// Returns the coordinator to spawn, or `None` if the request was
    /// rejected.
    async fn handle_create(&self, msg: Message) -> Option<TransferCoordinator> {
        let reply_to = channel::reply(&msg.id);

        if let Some(id) = self.accepted_session(&msg.id).await {
            tracing::debug!(correlation = %msg.id, session = %id, "create redelivered, repeating reply");
            self.reply_created(&msg, &reply_to, id.as_str());
            return None;
        }

        let req = match msg.payload_as::<CreateSessionRequest>(MessageType::CreateSession) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(correlation = %msg.id, "malformed create request: {e}");
                self.reply(&reply_to, msg.reply_error(ERR_CODE_BAD_REQUEST, e.to_string()));
                return None;
            }
        };

        if let Err(e) = validate_name(&req.name) {
            tracing::warn!(name = %req.name, "rejecting create request: {e}");
            self.reply(&reply_to, msg.reply_error(ERR_CODE_BAD_REQUEST, e.to_string()));
            return None;
        }

        let session = self.registry.create(&req.name, req.size).await;
        let sink = match self.sinks.open(session.id(), &req.name, req.size) {
            Ok(sink) => sink,
            Err(e) => {
                self.registry.remove(session.id()).await;
                let code = match &e {
                    TransferError::Conflict(_) => {
                        tracing::warn!(name = %req.name, "rejecting create request: {e}");
                        ERR_CODE_CONFLICT
                    }
                    _ => {
                        tracing::error!(session = %session.id(), "failed to open sink: {e}");
                        ERR_CODE_INTERNAL
                    }
                };
                self.reply(&reply_to, msg.reply_error(code, e.to_string()));
                return None;
            }
        };

        let id = session.id().to_string();
        let mailbox = Mailbox::open(self.bus.as_ref(), &id);

        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg.id.clone(), session.id().clone());
        self.reply_created(&msg, &reply_to, &id);
        tracing::info!(session = %id, name = %req.name, size = req.size, "session created");

        Some(TransferCoordinator::new(
            session,
            sink,
            Arc::clone(&self.bus),
            self.registry.clone(),
            self.config.clone(),
            mailbox,
            self.cancel.child_token(),
        ))
    }

    fn reply_created(&self, request: &Message, reply_to: &str, id: &str) {
        let created = SessionCreated { id: id.to_string() };
        match request.reply(MessageType::SessionCreated, Some(&created)) {
            Ok(reply) => self.reply(reply_to, reply),
            Err(e) => tracing::error!(session = %id, "failed to encode reply: {e}"),
        }
    }

    fn reply(&self, channel: &str, msg: Message) {
        if let Err(e) = self.bus.publish(channel, msg) {
            tracing::warn!(channel, "failed to publish reply: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use slicepull_bus::LocalBus;
    use slicepull_protocol::{ChunkRequest, ChunkResponse, DoneEvent};
    use slicepull_transfer::{DirectorySinkFactory, MemorySinkFactory, SessionId};

    struct Fixture {
        bus: LocalBus,
        server: Arc<IngestServer>,
        handle: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    fn start(config: ServerConfig, sinks: Arc<dyn SinkFactory>) -> Fixture {
        let bus = LocalBus::new();
        let server = IngestServer::new(config, Arc::new(bus.clone()), sinks);
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run().await });
        Fixture {
            bus,
            server,
            handle,
        }
    }

    /// Publishes a create request and returns the reply envelope.
    async fn create(bus: &LocalBus, correlation: &str, name: &str, size: u64) -> Message {
        let mut reply = bus.subscribe(&channel::reply(correlation));
        let req = CreateSessionRequest {
            name: name.into(),
            size,
        };
        let msg = Message::new(correlation, MessageType::CreateSession, Some(&req)).unwrap();
        bus.publish(CREATE_CHANNEL, msg).unwrap();
        reply.recv().await.unwrap()
    }

    fn session_id(reply: &Message) -> String {
        reply
            .payload_as::<SessionCreated>(MessageType::SessionCreated)
            .unwrap()
            .id
    }

    /// Plays a well-behaved client for an already created session.
    async fn serve(bus: &LocalBus, id: &str, data: &[u8]) -> bool {
        let mut requests = bus.subscribe(&channel::request(id));
        let mut done = bus.subscribe(&channel::done(id));
        let start = Message::new::<()>("s", MessageType::Start, None).unwrap();
        bus.publish(&channel::start(id), start).unwrap();

        loop {
            tokio::select! {
                msg = requests.recv() => {
                    let req: ChunkRequest =
                        msg.unwrap().payload_as(MessageType::ChunkRequest).unwrap();
                    let end = (req.offset + req.size) as usize;
                    let resp = ChunkResponse::encode(req.offset, &data[req.offset as usize..end]);
                    let msg = Message::new("r", MessageType::ChunkResponse, Some(&resp)).unwrap();
                    bus.publish(&channel::response(id), msg).unwrap();
                }
                msg = done.recv() => {
                    let event: DoneEvent = msg.unwrap().payload_as(MessageType::Done).unwrap();
                    return event.success;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn creates_session_and_ingests_file() {
        let sinks = MemorySinkFactory::new();
        let fx = start(
            ServerConfig {
                chunk_size: 100,
                ..ServerConfig::default()
            },
            Arc::new(sinks.clone()),
        );

        let reply = create(&fx.bus, "c1", "photo.png", 250).await;
        assert_eq!(reply.id, "c1");
        let id = session_id(&reply);
        assert!(
            fx.server
                .registry()
                .lookup(&SessionId::from(id.as_str()))
                .await
                .is_some()
        );

        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        assert!(serve(&fx.bus, &id, &data).await);
        assert_eq!(sinks.take(&SessionId::from(id.as_str())).unwrap(), data);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_removed_after_grace() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));
        let id = session_id(&create(&fx.bus, "c1", "empty.bin", 0).await);
        assert!(serve(&fx.bus, &id, &[]).await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fx.server.registry().is_empty().await);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_unsafe_names() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));

        for (i, name) in ["", "../escape", "/etc/passwd"].into_iter().enumerate() {
            let reply = create(&fx.bus, &format!("bad-{i}"), name, 10).await;
            assert_eq!(reply.msg_type, MessageType::Error);
            assert_eq!(reply.error.unwrap().code, ERR_CODE_BAD_REQUEST);
        }
        assert!(fx.server.registry().is_empty().await);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_malformed_create() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));
        let mut reply = fx.bus.subscribe(&channel::reply("m1"));
        let msg = Message::new(
            "m1",
            MessageType::CreateSession,
            Some(&serde_json::json!({"size": "big"})),
        )
        .unwrap();
        fx.bus.publish(CREATE_CHANNEL, msg).unwrap();

        let reply = reply.recv().await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Error);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sink_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the output directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let fx = start(
            ServerConfig::default(),
            Arc::new(DirectorySinkFactory::new(&blocker, false)),
        );

        let reply = create(&fx.bus, "c1", "a.zip", 10).await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, ERR_CODE_INTERNAL);
        assert!(fx.server.registry().is_empty().await);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sessions_are_independent() {
        let sinks = MemorySinkFactory::new();
        let fx = start(
            ServerConfig {
                chunk_size: 7,
                ..ServerConfig::default()
            },
            Arc::new(sinks.clone()),
        );

        let a = session_id(&create(&fx.bus, "a", "a.bin", 50).await);
        let b = session_id(&create(&fx.bus, "b", "b.bin", 33).await);
        assert_ne!(a, b);

        let data_a = vec![0xAAu8; 50];
        let data_b = vec![0xBBu8; 33];
        let (ok_a, ok_b) = tokio::join!(serve(&fx.bus, &a, &data_a), serve(&fx.bus, &b, &data_b));
        assert!(ok_a && ok_b);
        assert_eq!(sinks.take(&SessionId::from(a.as_str())).unwrap(), data_a);
        assert_eq!(sinks.take(&SessionId::from(b.as_str())).unwrap(), data_b);

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_is_refused_while_in_flight() {
        let out = tempfile::tempdir().unwrap();
        let fx = start(
            ServerConfig {
                chunk_size: 7,
                ..ServerConfig::default()
            },
            Arc::new(DirectorySinkFactory::new(out.path(), false)),
        );

        let a = session_id(&create(&fx.bus, "a", "x.bin", 50).await);
        let clash = create(&fx.bus, "b", "x.bin", 50).await;
        assert_eq!(clash.msg_type, MessageType::Error);
        assert_eq!(clash.error.unwrap().code, ERR_CODE_CONFLICT);
        assert_eq!(fx.server.registry().len().await, 1);

        let data_a = vec![0xAAu8; 50];
        assert!(serve(&fx.bus, &a, &data_a).await);
        assert_eq!(std::fs::read(out.path().join("x.bin")).unwrap(), data_a);

        // Once the first session has its verdict the name is free again.
        let c = session_id(&create(&fx.bus, "c", "x.bin", 50).await);
        let data_c = vec![0xBBu8; 50];
        assert!(serve(&fx.bus, &c, &data_c).await);
        assert_eq!(std::fs::read(out.path().join("x.bin")).unwrap(), data_c);

        let leftovers: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_create_gets_the_same_session() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));
        let mut replies = fx.bus.subscribe(&channel::reply("c1"));
        let req = CreateSessionRequest {
            name: "twice.bin".into(),
            size: 10,
        };
        let msg = Message::new("c1", MessageType::CreateSession, Some(&req)).unwrap();
        fx.bus.publish(CREATE_CHANNEL, msg.clone()).unwrap();
        fx.bus.publish(CREATE_CHANNEL, msg).unwrap();

        let first = session_id(&replies.recv().await.unwrap());
        let second = session_id(&replies.recv().await.unwrap());
        assert_eq!(first, second);
        assert_eq!(fx.server.registry().len().await, 1);

        // Never started: idle timeout, grace, then the create is forgotten.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(fx.server.registry().is_empty().await);
        assert!(fx.server.accepted.lock().unwrap().is_empty());

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_open_sessions() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));
        let id = session_id(&create(&fx.bus, "c1", "big.vhdx", 1 << 20).await);
        let mut done = fx.bus.subscribe(&channel::done(&id));

        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();

        let event: DoneEvent = done
            .recv()
            .await
            .unwrap()
            .payload_as(MessageType::Done)
            .unwrap();
        assert!(!event.success);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let fx = start(ServerConfig::default(), Arc::new(MemorySinkFactory::new()));
        while fx.server.requests.lock().unwrap().is_some() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            fx.server.run().await,
            Err(ServerError::AlreadyRunning)
        ));
        fx.server.shutdown();
        fx.handle.await.unwrap().unwrap();
    }
}
