use std::sync::Arc;

use config::RelayConfig;
use dotenv::dotenv;
use log::{error, info, warn};
use server_inner::ServerInner;
use session::SessionRegistry;
use tokio::sync::watch;
use tonic::transport::Server;
use upload::{LocalMediaStore, UploadProcessor};

pub mod service {
    tonic::include_proto!("relay");
}

mod config;
mod coordinator;
mod error;
mod process;
mod queue;
mod reconciler;
mod server_inner;
mod session;
mod supervisor;
mod transport;
mod upload;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let config = RelayConfig::from_env()?;
    info!(
        "relay listening on {} (transcoder {:?}, queue {} chunks, {})",
        config.listen_addr,
        config.supervisor.transcoder,
        config.supervisor.queue_capacity,
        config.supervisor.drop_policy
    );

    let registry = SessionRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = LocalMediaStore::new(&config.upload.publish_dir, &config.upload.public_base_url);
    let uploads = UploadProcessor::new(config.upload.clone(), Arc::new(store));
    let server = ServerInner::new(
        registry.clone(),
        config.supervisor.clone(),
        uploads,
        shutdown_rx,
    );

    let drain_registry = registry.clone();
    let shutdown_timeout = config.shutdown_timeout;
    Server::builder()
        .add_service(server.into_service())
        .serve_with_shutdown(config.listen_addr, async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", err);
                return;
            }
            info!("shutting down");
            let left =
                reconciler::drain_sessions(&drain_registry, &shutdown_tx, shutdown_timeout).await;
            if left > 0 {
                warn!("{} session(s) did not finish tearing down", left);
            }
        })
        .await?;

    info!("relay stopped");
    Ok(())
}
