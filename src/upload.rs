//! File upload boundary: store the upload, run the external processing
//! command on it, publish the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::UploadConfig;
use crate::error::{RelayError, RelayResult};

const PUBLISH_FOLDER: &str = "censored_videos";

/// Somewhere processed media can be made publicly reachable.
#[tonic::async_trait]
pub trait MediaStore: Send + Sync {
    /// Publishes `file` under `public_id` and returns its public URL.
    async fn publish(&self, file: &Path, public_id: &str) -> RelayResult<String>;
}

/// Publishes into a local directory. The relay does not serve that
/// directory; whatever answers `base_url` (a static file server or CDN)
/// must serve `root` for the returned URLs to resolve.
pub struct LocalMediaStore {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        LocalMediaStore {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[tonic::async_trait]
impl MediaStore for LocalMediaStore {
    async fn publish(&self, file: &Path, public_id: &str) -> RelayResult<String> {
        let folder = self.root.join(PUBLISH_FOLDER);
        fs::create_dir_all(&folder).await?;
        let file_name = format!("{}.mp4", public_id);
        fs::copy(file, folder.join(&file_name)).await?;
        Ok(format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            PUBLISH_FOLDER,
            file_name
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedUpload {
    pub message: String,
    pub censored_file: String,
}

pub struct UploadProcessor {
    config: UploadConfig,
    store: Arc<dyn MediaStore>,
}

impl UploadProcessor {
    pub fn new(config: UploadConfig, store: Arc<dyn MediaStore>) -> Self {
        UploadProcessor { config, store }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.config.max_upload_bytes
    }

    pub async fn process(&self, file_name: &str, content: &[u8]) -> RelayResult<ProcessedUpload> {
        let original = sanitize_file_name(file_name)?;
        fs::create_dir_all(&self.config.upload_dir).await?;

        let stamp = unix_millis();
        let input = self.config.upload_dir.join(format!("{}-{}", stamp, original));
        fs::write(&input, content).await?;

        let output_name = format!("{}-censored-{}.mp4", stamp, file_stem(&original));
        let output = self.config.upload_dir.join(&output_name);

        let input = absolute(&input)?;
        let output = absolute(&output)?;
        self.run_processor(&input, &output).await?;

        if !fs::try_exists(&output).await? {
            return Err(RelayError::upload(format!(
                "output file not found at {}",
                output.display()
            )));
        }

        let public_id = output_name.trim_end_matches(".mp4");
        let url = self.store.publish(&output, public_id).await?;
        if let Err(err) = fs::remove_file(&output).await {
            warn!("could not remove {}: {}", output.display(), err);
        }

        info!("published {} as {}", original, url);
        Ok(ProcessedUpload {
            message: "File processed successfully".to_string(),
            censored_file: url,
        })
    }

    async fn run_processor(&self, input: &Path, output: &Path) -> RelayResult<()> {
        info!(
            "running {} {:?} on {}",
            self.config.processor_program,
            self.config.processor_args,
            input.display()
        );
        let run = Command::new(&self.config.processor_program)
            .args(&self.config.processor_args)
            .arg(input)
            .arg(output)
            .current_dir(&self.config.processor_dir)
            .kill_on_drop(true)
            .output();

        let result = timeout(self.config.timeout, run)
            .await
            .map_err(|_| {
                RelayError::upload(format!(
                    "processor did not finish within {:?}",
                    self.config.timeout
                ))
            })?
            .map_err(|err| {
                RelayError::upload(format!(
                    "could not run {}: {}",
                    self.config.processor_program, err
                ))
            })?;

        debug!("processor output: {}", String::from_utf8_lossy(&result.stdout));
        if !result.status.success() {
            return Err(RelayError::upload(format!(
                "processor exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn sanitize_file_name(file_name: &str) -> RelayResult<String> {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RelayError::upload(format!("invalid file name {:?}", file_name)))
}

fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}

fn absolute(path: &Path) -> RelayResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
