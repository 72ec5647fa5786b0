use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::config::{StartPolicy, SupervisorConfig};
use crate::error::RelayError;
use crate::service::StreamSessionData;
use crate::session::SessionRegistry;
use crate::supervisor::{
    Driven, StartOutcome, StopCause, StopOutcome, Supervisor, SupervisorState,
};
use crate::transport::{EventSink, TransportEvent};

/// Binds one transport connection to one supervisor. All events of a
/// session are handled by a single task, one at a time.
pub struct SessionCoordinator {
    session_id: usize,
    supervisor: Supervisor,
    registry: SessionRegistry,
    events: EventSink,
}

impl SessionCoordinator {
    pub fn new(
        session_id: usize,
        config: Arc<SupervisorConfig>,
        registry: SessionRegistry,
        events: EventSink,
    ) -> Self {
        SessionCoordinator {
            session_id,
            supervisor: Supervisor::new(session_id, config),
            registry,
            events,
        }
    }

    #[cfg(test)]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn on_start(&mut self) {
        if self.supervisor.state().is_live()
            && self.supervisor.config().start_policy == StartPolicy::Restart
        {
            info!("session {} restarting transcoder", self.session_id);
            self.on_stop().await;
        }

        match self.supervisor.start() {
            Ok(StartOutcome::Spawned { pid }) => {
                debug!("session {} transcoder pid {:?} starting", self.session_id, pid);
                self.publish_state().await
            }
            Ok(StartOutcome::AlreadyLive) => {}
            Err(err) => self.report(err).await,
        }
    }

    pub async fn on_chunk(&mut self, payload: Vec<u8>) {
        if let Err(err) = self.supervisor.push_chunk(payload) {
            warn!("session {}: {}", self.session_id, err);
            self.events.error(self.supervisor.state(), &err);
        }
    }

    /// Chunks still queued when the stop arrives are dropped.
    pub async fn on_stop(&mut self) {
        self.teardown(StopCause::Requested).await;
    }

    /// Connection lost without a stop. Same teardown as `on_stop`.
    pub async fn on_disconnect(&mut self) {
        info!("session {} disconnected", self.session_id);
        self.teardown(StopCause::Requested).await;
    }

    async fn teardown(&mut self, cause: StopCause) {
        if !self.supervisor.state().is_live() {
            debug!("session {} stop with no live transcoder", self.session_id);
            return;
        }
        debug!(
            "session {} tearing down ({:?}, {} chunk(s) queued)",
            self.session_id,
            cause,
            self.supervisor.queued()
        );
        self.events.state(SupervisorState::Stopping);
        self.registry
            .update(self.session_id, SupervisorState::Stopping, self.supervisor.pid())
            .await;

        match self.supervisor.stop(cause).await {
            Ok(StopOutcome::Stopped { exit_code }) => {
                info!(
                    "session {} transcoder finished with {:?} ({} spawn(s), {} chunk(s) dropped)",
                    self.session_id,
                    exit_code,
                    self.supervisor.spawn_count(),
                    self.supervisor.dropped()
                );
                self.publish_state().await
            }
            Ok(StopOutcome::NotLive) => {}
            Err(err) => self.report(err).await,
        }
    }

    pub async fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Start => self.on_start().await,
            TransportEvent::Chunk(payload) => self.on_chunk(payload).await,
            TransportEvent::Stop => self.on_stop().await,
        }
    }

    async fn on_driven(&mut self, driven: Driven) {
        match driven {
            Driven::Wrote(written) => {
                trace!("session {} forwarded {} bytes", self.session_id, written)
            }
            Driven::Running => self.publish_state().await,
            Driven::Exited(err) => self.report(err).await,
            Driven::InputFailed(err) => {
                self.events.error(self.supervisor.state(), &err);
                self.teardown(StopCause::InputLost).await;
            }
        }
    }

    /// Runs the session until the client goes away or the server shuts
    /// down, then tears down the transcoder and leaves the registry.
    pub async fn run<S>(mut self, mut transport: S, mut shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = Result<StreamSessionData, Status>> + Unpin,
    {
        info!("session {} connected", self.session_id);

        loop {
            if self.supervisor.queued() > 0 {
                // Lets the I/O driver report the pipe writable before the
                // next frame is read, so queued chunks reach the transcoder
                // ahead of a stop.
                tokio::task::yield_now().await;
            }
            tokio::select! {
                biased;
                driven = self.supervisor.drive() => self.on_driven(driven).await,
                _ = shutdown.changed() => {
                    info!("session {} closing for server shutdown", self.session_id);
                    self.teardown(StopCause::Requested).await;
                    break;
                }
                frame = transport.next() => match frame {
                    Some(Ok(data)) => match TransportEvent::from_wire(data) {
                        Some(event) => self.dispatch(event).await,
                        None => warn!("session {} ignoring frame without event type", self.session_id),
                    },
                    Some(Err(status)) => {
                        warn!("session {} transport error: {}", self.session_id, status);
                        self.on_disconnect().await;
                        break;
                    }
                    None => {
                        self.on_disconnect().await;
                        break;
                    }
                },
            }
        }

        self.registry.remove(self.session_id).await;
        debug!("session {} removed", self.session_id);
    }

    async fn publish_state(&mut self) {
        let state = self.supervisor.state();
        self.events.state(state);
        self.registry
            .update(self.session_id, state, self.supervisor.pid())
            .await;
    }

    async fn report(&mut self, err: RelayError) {
        match &err {
            RelayError::TeardownTimeout { .. } => {
                warn!("session {} degraded but recovered: {}", self.session_id, err)
            }
            _ => warn!(
                "session {}: {} (last exit code {:?})",
                self.session_id,
                err,
                self.supervisor.last_exit_code()
            ),
        }
        let state = self.supervisor.state();
        self.events.error(state, &err);
        self.registry
            .update(self.session_id, state, self.supervisor.pid())
            .await;
    }
}
