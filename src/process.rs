use std::io;
use std::process::{ExitStatus, Stdio};

use log::{debug, trace};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::TranscoderCommand;
use crate::error::{RelayError, RelayResult};

/// A running transcoder. The child itself lives in a watcher task so that
/// its exit is observed even while nobody is writing to it; dropping the
/// handle kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
    signals: mpsc::UnboundedSender<Signal>,
    status: Option<ExitStatus>,
    reaped: bool,
}

/// Requests handled by the watcher task, which alone knows whether the
/// child has been reaped and its pid may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Terminate,
    Kill,
}

pub(crate) enum Progress {
    Exited(io::Result<ExitStatus>),
    Wrote(io::Result<usize>),
}

impl ProcessHandle {
    pub fn spawn(session_id: usize, command: &TranscoderCommand) -> RelayResult<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RelayError::ProcessSpawn {
                reason: format!("{}: {}", command.program.display(), err),
            })?;

        let stdin = child.stdin.take();
        if stdin.is_none() {
            return Err(RelayError::ProcessSpawn {
                reason: "transcoder stdin was not captured".to_string(),
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let secret = command.args.last().filter(|arg| arg.contains("://")).cloned();
            tokio::spawn(relay_stderr(session_id, stderr, secret));
        }

        let pid = child.id();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_exit(child, signal_rx, exit_tx));

        Ok(ProcessHandle {
            pid,
            stdin,
            exit: exit_rx,
            signals: signal_tx,
            status: None,
            reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn input_open(&self) -> bool {
        self.stdin.is_some()
    }

    /// Signals end-of-input. Any later write is refused.
    pub fn close_input(&mut self) {
        self.stdin = None;
    }

    /// Waits for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        if self.reaped {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "transcoder exit status unavailable",
            ));
        }
        let result = flatten_exit((&mut self.exit).await);
        self.record_exit(&result);
        result
    }

    /// Polls for exit and, concurrently, writes as much of `pending` as the
    /// pipe accepts. Exit wins when both are ready.
    pub(crate) async fn progress(&mut self, pending: Option<&[u8]>) -> Progress {
        let result = if self.reaped {
            match self.status {
                Some(status) => Progress::Exited(Ok(status)),
                None => std::future::pending().await,
            }
        } else {
            let exit = &mut self.exit;
            let stdin = self.stdin.as_mut();
            tokio::select! {
                biased;
                status = exit => Progress::Exited(flatten_exit(status)),
                written = write_some(stdin, pending) => Progress::Wrote(written),
            }
        };
        if let Progress::Exited(status) = &result {
            self.record_exit(status);
        }
        result
    }

    /// Asks the process to terminate (SIGTERM).
    pub fn terminate(&self) {
        let _ = self.signals.send(Signal::Terminate);
    }

    /// Forces the process down (SIGKILL) and lets the watcher reap it.
    pub fn kill(&self) {
        let _ = self.signals.send(Signal::Kill);
    }

    fn record_exit(&mut self, result: &io::Result<ExitStatus>) {
        self.reaped = true;
        self.stdin = None;
        if let Ok(status) = result {
            self.status = Some(*status);
        }
    }
}

fn flatten_exit(
    received: Result<io::Result<ExitStatus>, oneshot::error::RecvError>,
) -> io::Result<ExitStatus> {
    received.unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "transcoder watcher stopped unexpectedly",
        ))
    })
}

async fn write_some(stdin: Option<&mut ChildStdin>, pending: Option<&[u8]>) -> io::Result<usize> {
    match (stdin, pending) {
        (Some(stdin), Some(buf)) if !buf.is_empty() => {
            let written = stdin.write(buf).await?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            trace!("wrote {} of {} pending bytes", written, buf.len());
            Ok(written)
        }
        _ => std::future::pending().await,
    }
}

async fn watch_exit(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit: oneshot::Sender<io::Result<ExitStatus>>,
) {
    let status = loop {
        tokio::select! {
            biased;
            status = child.wait() => break status,
            signal = signals.recv() => match signal {
                Some(Signal::Terminate) => send_sigterm(&child),
                // Explicit kill, or the handle was dropped.
                Some(Signal::Kill) | None => {
                    if let Err(err) = child.start_kill() {
                        debug!("failed to kill transcoder: {}", err);
                    }
                    break child.wait().await;
                }
            },
        }
    };
    let _ = exit.send(status);
}

fn send_sigterm(child: &Child) {
    // `id` is None once the child has been reaped.
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "SIGTERM to pid {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

async fn relay_stderr(session_id: usize, stderr: ChildStderr, secret: Option<String>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &secret {
            Some(secret) => debug!(
                "session {} transcoder: {}",
                session_id,
                line.replace(secret.as_str(), "<ingest>")
            ),
            None => debug!("session {} transcoder: {}", session_id, line),
        }
    }
}
