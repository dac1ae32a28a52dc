use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slicepull_bus::Bus;
use slicepull_protocol::constants::CREATE_CHANNEL;
use slicepull_protocol::{
    CancelRequest, ChunkRequest, ChunkResponse, CreateSessionRequest, DoneEvent, Message,
    MessageType, SessionCreated, channel,
};
use slicepull_transfer::{FileSource, SpeedCalculator};
use tokio::time::Instant;

use crate::{ClientConfig, ClientError, UploadOutcome};

/// Minimum spacing between progress log lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Sends local files to an ingest server over a [`Bus`].
pub struct Uploader {
    bus: Arc<dyn Bus>,
    config: ClientConfig,
}

impl Uploader {
    pub fn new(bus: Arc<dyn Bus>, config: ClientConfig) -> Self {
        Self { bus, config }
    }

    /// Uploads the file at `path` under its own file name.
    pub async fn upload(&self, path: &Path) -> Result<UploadOutcome, ClientError> {
        let source = FileSource::open(path)?;
        let name = source.file_name();
        self.upload_source(source, &name).await
    }

    /// Uploads an already opened source under `name`.
    pub async fn upload_source(
        &self,
        mut source: FileSource,
        name: &str,
    ) -> Result<UploadOutcome, ClientError> {
        let size = source.len();
        let session_id = self.create_session(name, size).await?;
        tracing::info!(session = %session_id, name, size, "session created");

        let mut requests = self.bus.subscribe(&channel::request(&session_id));
        let mut done = self.bus.subscribe(&channel::done(&session_id));
        self.publish::<()>(&channel::start(&session_id), MessageType::Start, None)?;

        let mut speed = SpeedCalculator::new();
        let mut bytes_sent = 0u64;
        let mut cancelled = false;
        let mut last_report = Instant::now();

        loop {
            tokio::select! {
                msg = done.recv() => {
                    let msg = msg.ok_or(ClientError::Closed)?;
                    let event: DoneEvent = msg.payload_as(MessageType::Done)?;
                    tracing::info!(session = %session_id, success = event.success, bytes_sent, "upload finished");
                    return Ok(UploadOutcome {
                        session_id,
                        success: event.success,
                        bytes_sent,
                    });
                }

                msg = requests.recv() => {
                    let msg = msg.ok_or(ClientError::Closed)?;
                    let req = match msg.payload_as::<ChunkRequest>(MessageType::ChunkRequest) {
                        Ok(req) => req,
                        Err(e) => {
                            tracing::warn!(session = %session_id, "malformed chunk request: {e}");
                            continue;
                        }
                    };
                    if cancelled {
                        tracing::debug!(session = %session_id, offset = req.offset, "ignoring request after cancel");
                        continue;
                    }

                    match source.read(req.offset, req.size) {
                        Ok(data) => {
                            tracing::trace!(session = %session_id, offset = req.offset, size = req.size, "answering request");
                            let resp = ChunkResponse::encode(req.offset, &data);
                            self.publish(
                                &channel::response(&session_id),
                                MessageType::ChunkResponse,
                                Some(&resp),
                            )?;
                            bytes_sent = bytes_sent.max(req.offset + req.size);
                            speed.record(req.size);
                        }
                        Err(e) => {
                            tracing::error!(
                                session = %session_id,
                                offset = req.offset,
                                size = req.size,
                                "cannot read requested range, cancelling: {e}"
                            );
                            let cancel = CancelRequest { reason: e.to_string() };
                            self.publish(
                                &channel::cancel(&session_id),
                                MessageType::Cancel,
                                Some(&cancel),
                            )?;
                            cancelled = true;
                        }
                    }

                    if last_report.elapsed() >= PROGRESS_INTERVAL {
                        last_report = Instant::now();
                        let percent = if size == 0 {
                            100.0
                        } else {
                            bytes_sent as f64 / size as f64 * 100.0
                        };
                        tracing::info!(
                            session = %session_id,
                            sent = bytes_sent,
                            total = size,
                            "{percent:.1}% at {:.0} B/s, eta {:?}",
                            speed.bytes_per_second(),
                            speed.eta(size.saturating_sub(bytes_sent)),
                        );
                    }
                }

                _ = tokio::time::sleep(self.config.done_timeout) => {
                    tracing::warn!(session = %session_id, "server went silent");
                    return Err(ClientError::Timeout);
                }
            }
        }
    }

    /// Publishes a create request and waits for the session id.
    async fn create_session(&self, name: &str, size: u64) -> Result<String, ClientError> {
        let correlation = uuid::Uuid::new_v4().to_string();
        let mut reply = self.bus.subscribe(&channel::reply(&correlation));

        let req = CreateSessionRequest {
            name: name.to_string(),
            size,
        };
        let msg = Message::new(&correlation, MessageType::CreateSession, Some(&req))?;
        self.bus.publish(CREATE_CHANNEL, msg)?;

        let resp = match tokio::time::timeout(self.config.create_timeout, reply.recv()).await {
            Ok(Some(resp)) => resp,
            Ok(None) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Timeout),
        };

        let created: SessionCreated = resp.payload_as(MessageType::SessionCreated)?;
        Ok(created.id)
    }

    fn publish<T: serde::Serialize>(
        &self,
        channel: &str,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), ClientError> {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)?;
        self.bus.publish(channel, msg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use slicepull_bus::{LocalBus, Subscription};
    use slicepull_protocol::ProtocolError;
    use slicepull_protocol::constants::ERR_CODE_BAD_REQUEST;
    use slicepull_server::{IngestServer, ServerConfig};
    use slicepull_transfer::{DirectorySinkFactory, MemorySinkFactory, SessionId, SinkFactory};
    use tempfile::TempDir;

    const PNG_HEAD: &[u8] = b"\x89PNG\r\n\x1a\n";

    struct Env {
        server: Arc<IngestServer>,
        server_task: tokio::task::JoinHandle<()>,
        uploader: Uploader,
    }

    impl Env {
        async fn stop(self) {
            self.server.shutdown();
            self.server_task.await.unwrap();
        }
    }

    fn env(chunk_size: u64, sinks: Arc<dyn SinkFactory>) -> Env {
        let bus = LocalBus::new();
        let config = ServerConfig {
            chunk_size,
            ..ServerConfig::default()
        };
        let server = IngestServer::new(config, Arc::new(bus.clone()), sinks);
        let runner = Arc::clone(&server);
        let server_task = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        let uploader = Uploader::new(Arc::new(bus.clone()), ClientConfig::default());
        Env {
            server,
            server_task,
            uploader,
        }
    }

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn no_partials(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".part"))
    }

    fn sample(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_file_into_memory() {
        let dir = TempDir::new().unwrap();
        let data = sample(250);
        let path = write_file(&dir, "data.bin", &data);
        let sinks = MemorySinkFactory::new();
        let env = env(100, Arc::new(sinks.clone()));

        let outcome = env.uploader.upload(&path).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 250);
        assert_eq!(
            sinks
                .take(&SessionId::from(outcome.session_id.as_str()))
                .unwrap(),
            data
        );
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.bin", b"");
        let sinks = MemorySinkFactory::new();
        let env = env(100, Arc::new(sinks.clone()));

        let outcome = env.uploader.upload(&path).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 0);
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_into_directory() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let mut data = PNG_HEAD.to_vec();
        data.extend(sample(5000));
        let path = write_file(&src, "picture.png", &data);
        let env = env(
            1024,
            Arc::new(DirectorySinkFactory::new(out.path(), true)),
        );

        let outcome = env.uploader.upload(&path).await.unwrap();
        assert!(outcome.success);
        assert_eq!(std::fs::read(out.path().join("picture.png")).unwrap(), data);
        assert!(no_partials(out.path()));
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_format_is_rejected_by_directory_sink() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = write_file(&src, "notes.txt", b"just some text, no signature");
        let env = env(8, Arc::new(DirectorySinkFactory::new(out.path(), true)));

        let outcome = env.uploader.upload(&path).await.unwrap();
        assert!(!outcome.success);
        assert!(!out.path().join("notes.txt").exists());
        assert!(no_partials(out.path()));
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_name_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.bin", b"abc");
        let env = env(100, Arc::new(MemorySinkFactory::new()));

        let source = FileSource::open(&path).unwrap();
        let err = env
            .uploader
            .upload_source(source, "../outside.bin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::Remote { code, .. }) if code == ERR_CODE_BAD_REQUEST
        ));
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shrunk_file_cancels_the_session() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "shrinks.bin", &sample(300));
        let sinks = MemorySinkFactory::new();
        let env = env(100, Arc::new(sinks.clone()));

        let source = FileSource::open(&path).unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(150)
            .unwrap();

        let outcome = env
            .uploader
            .upload_source(source, "shrinks.bin")
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.bytes_sent, 100);
        let reason = sinks
            .failure(&SessionId::from(outcome.session_id.as_str()))
            .unwrap();
        assert!(reason.contains("cancelled"));
        env.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn create_times_out_without_server() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.bin", b"abc");
        let uploader = Uploader::new(Arc::new(LocalBus::new()), ClientConfig::default());

        let started = Instant::now();
        let err = uploader.upload(&path).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    /// Answers the next create request by hand and returns the session id.
    async fn accept_create(bus: &LocalBus, creates: &mut Subscription, id: &str) {
        let req = creates.recv().await.unwrap();
        let reply = req
            .reply(
                MessageType::SessionCreated,
                Some(&SessionCreated { id: id.into() }),
            )
            .unwrap();
        bus.publish(&channel::reply(&req.id), reply).unwrap();
    }

    fn publish<T: serde::Serialize>(bus: &LocalBus, channel: &str, t: MessageType, p: &T) {
        bus.publish(channel, Message::new("x", t, Some(p)).unwrap())
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_is_answered_again() {
        let dir = TempDir::new().unwrap();
        let data = sample(10);
        let path = write_file(&dir, "a.bin", &data);
        let bus = LocalBus::new();
        let mut creates = bus.subscribe(CREATE_CHANNEL);
        let mut starts = bus.subscribe(&channel::start("s1"));
        let mut responses = bus.subscribe(&channel::response("s1"));

        let uploader = Uploader::new(Arc::new(bus.clone()), ClientConfig::default());
        let upload = tokio::spawn(async move { uploader.upload(&path).await });

        accept_create(&bus, &mut creates, "s1").await;
        starts.recv().await.unwrap();

        let req = ChunkRequest {
            offset: 0,
            size: 10,
        };
        publish(&bus, &channel::request("s1"), MessageType::ChunkRequest, &req);
        publish(&bus, &channel::request("s1"), MessageType::ChunkRequest, &req);

        for _ in 0..2 {
            let msg = responses.recv().await.unwrap();
            let resp: ChunkResponse = msg.payload_as(MessageType::ChunkResponse).unwrap();
            assert_eq!(resp.offset, 0);
            assert_eq!(resp.decode().unwrap(), data);
        }

        publish(
            &bus,
            &channel::done("s1"),
            MessageType::Done,
            &DoneEvent { success: true },
        );
        let outcome = upload.await.unwrap().unwrap();
        assert_eq!(outcome.session_id, "s1");
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.bin", b"abc");
        let bus = LocalBus::new();
        let mut creates = bus.subscribe(CREATE_CHANNEL);

        let uploader = Uploader::new(
            Arc::new(bus.clone()),
            ClientConfig {
                done_timeout: Duration::from_secs(5),
                ..ClientConfig::default()
            },
        );
        let upload = tokio::spawn(async move { uploader.upload(&path).await });
        accept_create(&bus, &mut creates, "s1").await;

        assert!(matches!(
            upload.await.unwrap(),
            Err(ClientError::Timeout)
        ));
    }
}
