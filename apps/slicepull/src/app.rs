//! Wires the ingest server and the uploader together over an
//! in-process bus.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use slicepull_bus::LocalBus;
use slicepull_client::{ClientConfig, UploadOutcome, Uploader};
use slicepull_server::IngestServer;
use slicepull_transfer::DirectorySinkFactory;

use crate::config::Config;

/// Ingests `file` into the configured output directory.
///
/// Returns the server's verdict; errors are local failures (bad config,
/// unreadable file, no answer from the server).
pub async fn run(config: Config, file: &Path) -> anyhow::Result<UploadOutcome> {
    let output = PathBuf::from(&config.output_dir);
    std::fs::create_dir_all(&output)?;

    let bus = Arc::new(LocalBus::new());
    let sinks = Arc::new(DirectorySinkFactory::new(
        &output,
        config.require_known_format,
    ));
    let server = IngestServer::new(config.server_config(), bus.clone(), sinks);

    let server_run = Arc::clone(&server);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    let uploader = Uploader::new(bus, ClientConfig::default());
    let result = tokio::select! {
        result = uploader.upload(file) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    server.shutdown();
    server_task.await?;
    result
}
