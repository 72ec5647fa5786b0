//! Teardown shared by every way a session can end: explicit stop, client
//! disconnect, transport error, broken transcoder input and server shutdown.

use std::process::ExitStatus;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use crate::process::ProcessHandle;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub exit_code: Option<i32>,
    /// The process had to be signalled after the grace period.
    pub forced: bool,
}

/// Closes the transcoder's input and waits for it to exit. The whole
/// teardown fits inside `grace`: the last two steps of up to `kill_timeout`
/// each (capped at a quarter of `grace`) are spent after SIGTERM and after
/// SIGKILL, the rest waiting for a clean exit.
pub async fn teardown(
    session_id: usize,
    mut handle: ProcessHandle,
    grace: Duration,
    kill_timeout: Duration,
) -> TeardownReport {
    let (clean_exit, step) = escalation_steps(grace, kill_timeout);
    handle.close_input();

    if let Ok(status) = timeout(clean_exit, handle.wait()).await {
        return report(status.ok(), false);
    }

    warn!(
        "session {} transcoder (pid {:?}) still running {:?} after end-of-input, sending SIGTERM",
        session_id,
        handle.pid(),
        clean_exit
    );
    handle.terminate();
    if let Ok(status) = timeout(step, handle.wait()).await {
        return report(status.ok(), true);
    }

    warn!(
        "session {} transcoder (pid {:?}) ignored SIGTERM, killing",
        session_id,
        handle.pid()
    );
    handle.kill();
    match timeout(step, handle.wait()).await {
        Ok(status) => report(status.ok(), true),
        Err(_) => {
            // The watcher keeps waiting on the child; nothing more to do here.
            error!(
                "session {} transcoder (pid {:?}) could not be reaped",
                session_id,
                handle.pid()
            );
            TeardownReport {
                exit_code: None,
                forced: true,
            }
        }
    }
}

/// Splits `grace` into the wait for a clean exit and the wait after each
/// signal.
fn escalation_steps(grace: Duration, kill_timeout: Duration) -> (Duration, Duration) {
    let step = kill_timeout.min(grace / 4);
    (grace - step * 2, step)
}

fn report(status: Option<ExitStatus>, forced: bool) -> TeardownReport {
    TeardownReport {
        exit_code: status.and_then(|status| status.code()),
        forced,
    }
}

/// Tells every session to tear down and waits for the registry to empty.
/// Returns the number of sessions still registered when `deadline` ran out.
pub async fn drain_sessions(
    registry: &SessionRegistry,
    shutdown: &watch::Sender<bool>,
    deadline: Duration,
) -> usize {
    let live = registry.len().await;
    if live > 0 {
        info!("tearing down {} live session(s)", live);
    }
    let _ = shutdown.send(true);

    let until = Instant::now() + deadline;
    loop {
        let remaining = registry.len().await;
        if remaining == 0 {
            return 0;
        }
        if Instant::now() >= until {
            for session in registry.snapshot().await {
                error!(
                    "session {} still {:?} at shutdown (pid {:?}, open for {:?})",
                    session.id,
                    session.state,
                    session.get_ffmpeg_pid(),
                    session.created_at.elapsed().unwrap_or_default()
                );
            }
            return remaining;
        }
        sleep(Duration::from_millis(20)).await;
    }
}
