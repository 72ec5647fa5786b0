use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::queue::DropPolicy;

const DEFAULT_RTMP_URL: &str = "rtmp://a.rtmp.youtube.com/live2";

/// What a `start` does while a transcoder is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    Ignore,
    Restart,
}

impl FromStr for StartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(StartPolicy::Ignore),
            "restart" => Ok(StartPolicy::Restart),
            other => Err(format!(
                "unknown start policy {:?}, expected ignore or restart",
                other
            )),
        }
    }
}

/// Encoder knobs that vary between deployments.
#[derive(Debug, Clone)]
pub struct EncodingParams {
    pub video_preset: String,
    pub audio_bitrate: String,
}

impl Default for EncodingParams {
    fn default() -> Self {
        EncodingParams {
            video_preset: "veryfast".to_string(),
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// Program and arguments used to launch one transcoder.
#[derive(Clone)]
pub struct TranscoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TranscoderCommand {
    /// webm on stdin, h264/aac flv to the ingest endpoint, tuned for latency.
    pub fn ffmpeg(binary: impl Into<PathBuf>, ingest_url: &str, params: &EncodingParams) -> Self {
        let args = [
            "-re",
            "-f",
            "webm",
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            params.video_preset.as_str(),
            "-tune",
            "zerolatency",
            "-c:a",
            "aac",
            "-ar",
            "44100",
            "-b:a",
            params.audio_bitrate.as_str(),
            "-f",
            "flv",
            ingest_url,
        ];
        TranscoderCommand {
            program: binary.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn custom<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TranscoderCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

// The argument list carries the stream key, keep it out of logs.
impl fmt::Debug for TranscoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscoderCommand")
            .field("program", &self.program)
            .field("args", &format_args!("<{} redacted>", self.args.len()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub transcoder: TranscoderCommand,
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    pub start_policy: StartPolicy,
    /// A transcoder that dies inside this window failed to start.
    pub startup_window: Duration,
    /// Time from a stop request to the process being gone, escalation
    /// included.
    pub grace_period: Duration,
    /// Wait after SIGTERM and after SIGKILL, at most a quarter of the grace
    /// period each.
    pub kill_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(transcoder: TranscoderCommand) -> Self {
        SupervisorConfig {
            transcoder,
            queue_capacity: 64,
            drop_policy: DropPolicy::DropOldest,
            start_policy: StartPolicy::Ignore,
            startup_window: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub processor_program: String,
    pub processor_args: Vec<String>,
    pub processor_dir: PathBuf,
    pub publish_dir: PathBuf,
    pub public_base_url: String,
    pub timeout: Duration,
    /// Largest `UploadMedia` request the server decodes.
    pub max_upload_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            upload_dir: PathBuf::from("uploads"),
            processor_program: "python3".to_string(),
            processor_args: vec!["main.py".to_string()],
            processor_dir: PathBuf::from("StreamShield"),
            publish_dir: PathBuf::from("published"),
            public_base_url: "http://localhost:3000/media".to_string(),
            timeout: Duration::from_secs(600),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub supervisor: SupervisorConfig,
    pub upload: UploadConfig,
    pub shutdown_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let ingest_url = match env.string("RELAY_INGEST_URL") {
            Some(url) => url,
            None => {
                let base = env
                    .string("RELAY_RTMP_URL")
                    .unwrap_or_else(|| DEFAULT_RTMP_URL.to_string());
                let key = env.string("RELAY_STREAM_KEY").ok_or_else(|| {
                    RelayError::config(
                        "RELAY_STREAM_KEY",
                        "required unless RELAY_INGEST_URL is set",
                    )
                })?;
                format!("{}/{}", base.trim_end_matches('/'), key)
            }
        };

        let mut params = EncodingParams::default();
        if let Some(preset) = env.string("RELAY_VIDEO_PRESET") {
            params.video_preset = preset;
        }
        if let Some(bitrate) = env.string("RELAY_AUDIO_BITRATE") {
            params.audio_bitrate = bitrate;
        }
        let ffmpeg = env
            .string("FFMPEG_PATH")
            .unwrap_or_else(|| "ffmpeg".to_string());

        let mut supervisor =
            SupervisorConfig::new(TranscoderCommand::ffmpeg(ffmpeg, &ingest_url, &params));
        supervisor.queue_capacity = env.parse("RELAY_QUEUE_CAPACITY", supervisor.queue_capacity)?;
        if supervisor.queue_capacity == 0 {
            return Err(RelayError::config("RELAY_QUEUE_CAPACITY", "must be at least 1"));
        }
        supervisor.drop_policy = env.parse("RELAY_DROP_POLICY", supervisor.drop_policy)?;
        supervisor.start_policy = env.parse("RELAY_START_POLICY", supervisor.start_policy)?;
        supervisor.startup_window = env.millis("RELAY_STARTUP_WINDOW_MS", supervisor.startup_window)?;
        supervisor.grace_period = env.millis("RELAY_GRACE_PERIOD_MS", supervisor.grace_period)?;
        supervisor.kill_timeout = env.millis("RELAY_KILL_TIMEOUT_MS", supervisor.kill_timeout)?;

        let mut upload = UploadConfig::default();
        if let Some(dir) = env.string("RELAY_UPLOAD_DIR") {
            upload.upload_dir = dir.into();
        }
        if let Some(command) = env.string("RELAY_PROCESSOR") {
            let mut parts = command.split_whitespace().map(str::to_string);
            upload.processor_program = parts
                .next()
                .ok_or_else(|| RelayError::config("RELAY_PROCESSOR", "empty command"))?;
            upload.processor_args = parts.collect();
        }
        if let Some(dir) = env.string("RELAY_PROCESSOR_DIR") {
            upload.processor_dir = dir.into();
        }
        if let Some(dir) = env.string("RELAY_PUBLISH_DIR") {
            upload.publish_dir = dir.into();
        }
        if let Some(url) = env.string("RELAY_PUBLIC_BASE_URL") {
            upload.public_base_url = url.trim_end_matches('/').to_string();
        }
        let timeout_secs = env.parse("RELAY_UPLOAD_TIMEOUT_SECS", upload.timeout.as_secs())?;
        upload.timeout = Duration::from_secs(timeout_secs);
        upload.max_upload_bytes = env.parse("RELAY_MAX_UPLOAD_BYTES", upload.max_upload_bytes)?;

        Ok(RelayConfig {
            listen_addr: env.parse("RELAY_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 50051)))?,
            supervisor,
            upload,
            shutdown_timeout: env.millis("RELAY_SHUTDOWN_TIMEOUT_MS", Duration::from_secs(10))?,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<'a, F> Env<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> RelayResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|err: T::Err| RelayError::config(key, err.to_string())),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> RelayResult<Duration> {
        let millis = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(millis))
    }
}
