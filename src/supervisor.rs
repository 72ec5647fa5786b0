//! Owns the transcoder process for one session: spawning it, feeding its
//! stdin from a bounded queue, and taking it down again.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::time::{sleep_until, Instant};

use crate::config::SupervisorConfig;
use crate::error::{RelayError, RelayResult};
use crate::process::{ProcessHandle, Progress};
use crate::queue::ChunkQueue;
use crate::reconciler::{self, TeardownReport};
use crate::service::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl SupervisorState {
    /// A transcoder exists and accepts input.
    pub fn is_live(self) -> bool {
        matches!(self, SupervisorState::Starting | SupervisorState::Running)
    }
}

impl From<SupervisorState> for SessionState {
    fn from(state: SupervisorState) -> Self {
        match state {
            SupervisorState::Idle => SessionState::Idle,
            SupervisorState::Starting => SessionState::Starting,
            SupervisorState::Running => SessionState::Running,
            SupervisorState::Stopping => SessionState::Stopping,
            SupervisorState::Terminated => SessionState::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Spawned { pid: Option<u32> },
    AlreadyLive,
}

/// Why a transcoder is being taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Stop, disconnect, restart or server shutdown.
    Requested,
    /// Its stdin broke while being written; an exit other than a clean one
    /// means the process went away on its own.
    InputLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotLive,
    Stopped { exit_code: Option<i32> },
}

/// Something that happened while driving the transcoder.
#[derive(Debug)]
pub enum Driven {
    /// The pipe accepted this many bytes.
    Wrote(usize),
    /// The startup window passed with the process still alive.
    Running,
    /// The process went away on its own; the supervisor is terminated.
    Exited(RelayError),
    /// Writing to stdin failed. The caller must tear the process down.
    InputFailed(RelayError),
}

pub struct Supervisor {
    session_id: usize,
    config: Arc<SupervisorConfig>,
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    queue: ChunkQueue,
    startup_deadline: Option<Instant>,
    spawn_count: u64,
    last_exit_code: Option<i32>,
}

impl Supervisor {
    pub fn new(session_id: usize, config: Arc<SupervisorConfig>) -> Self {
        let queue = ChunkQueue::new(config.queue_capacity, config.drop_policy);
        Supervisor {
            session_id,
            config,
            state: SupervisorState::Idle,
            handle: None,
            queue,
            startup_deadline: None,
            spawn_count: 0,
            last_exit_code: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawns a transcoder unless one is already live.
    pub fn start(&mut self) -> RelayResult<StartOutcome> {
        if self.state.is_live() {
            debug!(
                "session {} start ignored, transcoder already {:?}",
                self.session_id, self.state
            );
            return Ok(StartOutcome::AlreadyLive);
        }

        self.state = SupervisorState::Starting;
        self.queue.clear();
        self.last_exit_code = None;

        match ProcessHandle::spawn(self.session_id, &self.config.transcoder) {
            Ok(handle) => {
                let pid = handle.pid();
                info!("session {} spawned transcoder pid {:?}", self.session_id, pid);
                self.spawn_count += 1;
                self.startup_deadline = Some(Instant::now() + self.config.startup_window);
                self.handle = Some(handle);
                Ok(StartOutcome::Spawned { pid })
            }
            Err(err) => {
                self.state = SupervisorState::Terminated;
                Err(err)
            }
        }
    }

    /// Queues a chunk for the transcoder. A no-op unless a transcoder is
    /// live with its input open; an error only reports dropped chunks.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) -> RelayResult<()> {
        let accepting = self.state.is_live()
            && self.handle.as_ref().map_or(false, ProcessHandle::input_open);
        if !accepting {
            trace!(
                "session {} ignoring {} byte chunk while {:?}",
                self.session_id,
                chunk.len(),
                self.state
            );
            return Ok(());
        }

        if self.queue.push(chunk).dropped() {
            return Err(RelayError::BackpressureOverflow {
                capacity: self.queue.capacity(),
                dropped: self.queue.dropped(),
            });
        }
        Ok(())
    }

    /// Makes progress on the live transcoder: writes queued bytes, notices
    /// the end of the startup window and observes process exit. Pending
    /// forever when no transcoder is live. Cancel safe.
    pub async fn drive(&mut self) -> Driven {
        let startup_deadline = if self.state == SupervisorState::Starting {
            self.startup_deadline
        } else {
            None
        };
        // A pipe that keeps accepting writes must not hold back RUNNING.
        if self.handle.is_some() && startup_deadline.map_or(false, |at| at <= Instant::now()) {
            return self.enter_running();
        }
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };

        let progress = tokio::select! {
            biased;
            progress = handle.progress(self.queue.front_remaining()) => Some(progress),
            _ = startup_elapsed(startup_deadline) => None,
        };

        match progress {
            None => self.enter_running(),
            Some(Progress::Wrote(Ok(written))) => {
                self.queue.advance(written);
                Driven::Wrote(written)
            }
            Some(Progress::Wrote(Err(err))) => {
                let discarded = self.queue.clear();
                if let Some(handle) = self.handle.as_mut() {
                    handle.close_input();
                }
                warn!(
                    "session {} transcoder input failed ({} chunk(s) discarded): {}",
                    self.session_id, discarded, err
                );
                Driven::InputFailed(RelayError::InputClosed(err))
            }
            Some(Progress::Exited(status)) => {
                let code = status.as_ref().ok().and_then(|status| status.code());
                let was_starting = self.state == SupervisorState::Starting;
                self.handle = None;
                self.startup_deadline = None;
                self.state = SupervisorState::Terminated;
                self.last_exit_code = code;
                let discarded = self.queue.clear();
                warn!(
                    "session {} transcoder exited on its own with {:?}, {} chunk(s) discarded",
                    self.session_id, code, discarded
                );

                if was_starting {
                    let reason = match code {
                        Some(code) => format!("transcoder exited during startup with code {}", code),
                        None => "transcoder killed during startup".to_string(),
                    };
                    Driven::Exited(RelayError::ProcessSpawn { reason })
                } else {
                    Driven::Exited(RelayError::UnexpectedProcessExit { code })
                }
            }
        }
    }

    /// Takes the transcoder down: drops every queued chunk, closes stdin
    /// and waits for it to exit, forcing it down if it overstays the grace
    /// period.
    pub async fn stop(&mut self, cause: StopCause) -> RelayResult<StopOutcome> {
        let Some(handle) = self.handle.take() else {
            trace!("session {} stop ignored while {:?}", self.session_id, self.state);
            return Ok(StopOutcome::NotLive);
        };

        self.state = SupervisorState::Stopping;
        self.startup_deadline = None;
        let discarded = self.queue.clear();
        info!(
            "session {} stopping transcoder pid {:?} ({:?}, {} queued chunk(s) discarded)",
            self.session_id,
            handle.pid(),
            cause,
            discarded
        );

        let TeardownReport { exit_code, forced } = reconciler::teardown(
            self.session_id,
            handle,
            self.config.grace_period,
            self.config.kill_timeout,
        )
        .await;
        self.state = SupervisorState::Terminated;
        self.last_exit_code = exit_code;

        if forced {
            return Err(RelayError::TeardownTimeout {
                grace: self.config.grace_period,
            });
        }
        match (cause, exit_code) {
            (_, Some(0)) => info!("session {} transcoder exited cleanly", self.session_id),
            (StopCause::InputLost, code) => {
                return Err(RelayError::UnexpectedProcessExit { code });
            }
            (StopCause::Requested, other) => warn!(
                "session {} transcoder exited with {:?} after end-of-input",
                self.session_id, other
            ),
        }
        Ok(StopOutcome::Stopped { exit_code })
    }

    fn enter_running(&mut self) -> Driven {
        self.state = SupervisorState::Running;
        self.startup_deadline = None;
        debug!("session {} transcoder running", self.session_id);
        Driven::Running
    }
}

async fn startup_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::config::TranscoderCommand;
    use crate::queue::DropPolicy;

    fn config_for(script: &str, arg: &str) -> SupervisorConfig {
        let mut config =
            SupervisorConfig::new(TranscoderCommand::custom("sh", ["-c", script, arg]));
        config.startup_window = Duration::from_millis(50);
        config.grace_period = Duration::from_millis(200);
        config.kill_timeout = Duration::from_millis(300);
        config
    }

    fn supervisor(config: SupervisorConfig) -> Supervisor {
        Supervisor::new(1, Arc::new(config))
    }

    /// Drives until the queue is flushed or the process is gone.
    async fn flush(supervisor: &mut Supervisor) -> Option<Driven> {
        while supervisor.queued() > 0 {
            match timeout(Duration::from_secs(2), supervisor.drive()).await {
                Ok(Driven::Wrote(_)) | Ok(Driven::Running) => {}
                Ok(other) => return Some(other),
                Err(_) => panic!("queue never drained"),
            }
        }
        None
    }

    #[tokio::test]
    async fn writes_chunks_in_order_then_eof() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.webm");
        let mut supervisor = supervisor(config_for("cat > \"$0\"", out.to_str().unwrap()));

        assert!(matches!(supervisor.start(), Ok(StartOutcome::Spawned { .. })));
        for chunk in [b"A", b"B", b"C"] {
            supervisor.push_chunk(chunk.to_vec()).unwrap();
        }
        assert!(flush(&mut supervisor).await.is_none());

        let outcome = supervisor.stop(StopCause::Requested).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { exit_code: Some(0) });
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(std::fs::read(&out).unwrap(), b"ABC");
    }

    #[tokio::test]
    async fn stop_drops_chunks_not_yet_written() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.webm");
        let mut supervisor = supervisor(config_for("cat > \"$0\"", out.to_str().unwrap()));

        supervisor.start().unwrap();
        supervisor.push_chunk(b"A".to_vec()).unwrap();
        supervisor.push_chunk(b"B".to_vec()).unwrap();
        assert_eq!(supervisor.queued(), 2);

        let outcome = supervisor.stop(StopCause::Requested).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { exit_code: Some(0) });
        assert_eq!(supervisor.queued(), 0);
        assert_eq!(std::fs::read(&out).unwrap_or_default(), b"");
    }

    #[tokio::test]
    async fn second_start_does_not_spawn_again() {
        let mut supervisor = supervisor(config_for("cat > /dev/null", "x"));

        assert!(matches!(supervisor.start(), Ok(StartOutcome::Spawned { .. })));
        let pid = supervisor.pid();
        assert_eq!(supervisor.start().unwrap(), StartOutcome::AlreadyLive);
        assert_eq!(supervisor.spawn_count(), 1);
        assert_eq!(supervisor.pid(), pid);

        supervisor.stop(StopCause::Requested).await.unwrap();
    }

    #[tokio::test]
    async fn chunk_and_stop_without_start_are_noops() {
        let mut supervisor = supervisor(config_for("cat > /dev/null", "x"));

        supervisor.push_chunk(b"early".to_vec()).unwrap();
        assert_eq!(supervisor.queued(), 0);
        assert_eq!(supervisor.stop(StopCause::Requested).await.unwrap(), StopOutcome::NotLive);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(supervisor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn chunk_and_stop_after_termination_are_noops() {
        let mut supervisor = supervisor(config_for("cat > /dev/null", "x"));
        supervisor.start().unwrap();
        supervisor.stop(StopCause::Requested).await.unwrap();

        supervisor.push_chunk(b"late".to_vec()).unwrap();
        assert_eq!(supervisor.queued(), 0);
        assert_eq!(supervisor.stop(StopCause::Requested).await.unwrap(), StopOutcome::NotLive);
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn becomes_running_after_startup_window() {
        let mut supervisor = supervisor(config_for("cat > /dev/null", "x"));
        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Starting);

        let driven = timeout(Duration::from_secs(2), supervisor.drive()).await.unwrap();
        assert!(matches!(driven, Driven::Running));
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop(StopCause::Requested).await.unwrap();
    }

    #[tokio::test]
    async fn startup_window_wins_over_pending_writes() {
        let mut supervisor = supervisor(config_for("cat > /dev/null", "x"));
        supervisor.start().unwrap();
        supervisor.push_chunk(b"A".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let driven = timeout(Duration::from_secs(2), supervisor.drive()).await.unwrap();
        assert!(matches!(driven, Driven::Running));
        assert_eq!(supervisor.queued(), 1);
        supervisor.stop(StopCause::Requested).await.unwrap();
    }

    #[tokio::test]
    async fn broken_input_then_non_zero_exit_is_unexpected() {
        let mut config = config_for("exec 0<&-; sleep 0.3; exit 3", "x");
        config.grace_period = Duration::from_secs(2);
        let mut supervisor = supervisor(config);
        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.push_chunk(b"A".to_vec()).unwrap();

        let failed = loop {
            match timeout(Duration::from_secs(2), supervisor.drive()).await.unwrap() {
                Driven::InputFailed(err) => break err,
                Driven::Running | Driven::Wrote(_) => {}
                Driven::Exited(err) => panic!("exit seen before the broken pipe: {}", err),
            }
        };
        assert!(matches!(failed, RelayError::InputClosed(_)));

        let err = supervisor.stop(StopCause::InputLost).await.unwrap_err();
        assert!(matches!(err, RelayError::UnexpectedProcessExit { code: Some(3) }));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(supervisor.last_exit_code(), Some(3));
    }

    #[tokio::test]
    async fn crash_is_reported_and_restart_spawns_fresh_process() {
        let mut supervisor = supervisor(config_for("sleep 0.3; exit 3", "x"));
        supervisor.start().unwrap();
        let first_pid = supervisor.pid();
        supervisor.push_chunk(b"A".to_vec()).unwrap();

        let exited = loop {
            match timeout(Duration::from_secs(2), supervisor.drive()).await.unwrap() {
                Driven::Exited(err) => break err,
                Driven::Wrote(_) | Driven::Running => {}
                Driven::InputFailed(err) => panic!("unexpected input failure: {}", err),
            }
        };
        assert!(matches!(exited, RelayError::UnexpectedProcessExit { code: Some(3) }));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(supervisor.last_exit_code(), Some(3));

        assert!(matches!(supervisor.start(), Ok(StartOutcome::Spawned { .. })));
        assert_eq!(supervisor.spawn_count(), 2);
        assert_ne!(supervisor.pid(), first_pid);
        supervisor.stop(StopCause::Requested).await.ok();
    }

    #[tokio::test]
    async fn exit_inside_startup_window_is_a_spawn_error() {
        let mut config = config_for("exit 1", "x");
        config.startup_window = Duration::from_secs(5);
        let mut supervisor = supervisor(config);
        supervisor.start().unwrap();

        let driven = timeout(Duration::from_secs(2), supervisor.drive()).await.unwrap();
        assert!(matches!(driven, Driven::Exited(RelayError::ProcessSpawn { .. })));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = SupervisorConfig::new(TranscoderCommand::custom(
            "/nonexistent/ffmpeg",
            Vec::<String>::new(),
        ));
        let mut supervisor = supervisor(config);

        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, RelayError::ProcessSpawn { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(supervisor.stop(StopCause::Requested).await.unwrap(), StopOutcome::NotLive);
    }

    #[tokio::test]
    async fn stalled_consumer_never_grows_queue_past_capacity() {
        let mut config = config_for("exec sleep 30", "x");
        config.queue_capacity = 4;
        config.drop_policy = DropPolicy::DropNewest;
        let mut supervisor = supervisor(config);
        supervisor.start().unwrap();

        let mut overflows = 0;
        for _ in 0..40 {
            if let Err(err) = supervisor.push_chunk(vec![0u8; 64 * 1024]) {
                assert!(matches!(err, RelayError::BackpressureOverflow { capacity: 4, .. }));
                overflows += 1;
            }
            assert!(supervisor.queued() <= 4);
            let _ = timeout(Duration::from_millis(5), supervisor.drive()).await;
        }

        assert!(overflows > 0);
        assert_eq!(supervisor.dropped(), overflows);
        assert!(supervisor.queued() <= 4);

        let started = Instant::now();
        let err = supervisor.stop(StopCause::Requested).await.unwrap_err();
        assert!(matches!(err, RelayError::TeardownTimeout { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(supervisor.queued(), 0);
        assert!(started.elapsed() < supervisor.config().grace_period + Duration::from_millis(200));
    }
}
