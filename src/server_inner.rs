use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::config::SupervisorConfig;
use crate::coordinator::SessionCoordinator;
use crate::service::{
    relay_server::{Relay, RelayServer},
    StreamSessionData, StreamSessionEvent, UploadMediaRequest,
    UploadMediaResponse,
};
use crate::session::SessionRegistry;
use crate::transport::EventSink;
use crate::upload::UploadProcessor;

/// Outbound events buffered per session before the client is considered
/// too slow and events start being dropped.
const EVENT_BUFFER: usize = 32;

pub struct ServerInner {
    sessions: SessionRegistry,
    supervisor: Arc<SupervisorConfig>,
    uploads: Arc<UploadProcessor>,
    shutdown: watch::Receiver<bool>,
}

impl ServerInner {
    pub fn new(
        sessions: SessionRegistry,
        supervisor: SupervisorConfig,
        uploads: UploadProcessor,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ServerInner {
            sessions,
            supervisor: Arc::new(supervisor),
            uploads: Arc::new(uploads),
            shutdown,
        }
    }

    /// The tonic service, accepting uploads up to the configured size.
    pub fn into_service(self) -> RelayServer<Self> {
        let max_upload = self.uploads.max_upload_bytes();
        RelayServer::new(self).max_decoding_message_size(max_upload)
    }
}

#[tonic::async_trait]
impl Relay for ServerInner {
    type StreamSessionStream = ReceiverStream<Result<StreamSessionEvent, Status>>;

    async fn stream_session(
        &self,
        request: Request<Streaming<StreamSessionData>>,
    ) -> Result<Response<Self::StreamSessionStream>, Status> {
        if *self.shutdown.borrow() {
            return Err(Status::unavailable("relay is shutting down"));
        }

        let remote = request.remote_addr();
        let in_stream = request.into_inner();

        let session_id = self.sessions.insert().await;
        info!("session {} opened from {:?}", session_id, remote);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let coordinator = SessionCoordinator::new(
            session_id,
            self.supervisor.clone(),
            self.sessions.clone(),
            EventSink::new(session_id, tx),
        );
        tokio::spawn(coordinator.run(in_stream, self.shutdown.clone()));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn upload_media(
        &self,
        request: Request<UploadMediaRequest>,
    ) -> Result<Response<UploadMediaResponse>, Status> {
        let UploadMediaRequest { file_name, content } = request.into_inner();

        match self.uploads.process(&file_name, &content).await {
            Ok(processed) => Ok(Response::new(UploadMediaResponse {
                message: processed.message,
                censored_file: processed.censored_file,
            })),
            Err(err) => {
                warn!("error processing upload {:?}: {}", file_name, err);
                Err(err.into())
            }
        }
    }
}
