use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{DubError, Result};
use crate::media::MediaRef;

/// Saves media produced by the stage services (merged video, audio) locally
pub struct MediaFetcher {
    client: Client,
    show_progress: bool,
}

impl MediaFetcher {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(DubError::Http)?;

        Ok(Self {
            client,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Download `media` to `dest`. When `dest` is a directory the remote file
    /// name is used. Returns the written path.
    pub async fn download(&self, media: &MediaRef, dest: &Path) -> Result<PathBuf> {
        let local_path = if dest.is_dir() {
            let name = media.file_name().ok_or_else(|| {
                DubError::Download(format!("cannot derive a file name from {}", media))
            })?;
            dest.join(name)
        } else {
            dest.to_path_buf()
        };

        info!("Downloading {} to {}", media, local_path.display());

        let mut response = self.client.get(media.as_str()).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::Download(format!(
                "{} returned HTTP {}: {}",
                media, status, body
            )));
        }

        let pb = if self.show_progress {
            let pb = ProgressBar::new(response.content_length().unwrap_or(0));
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .map_err(|e| DubError::Download(format!("progress template: {}", e)))?
                .progress_chars("#>-");
            pb.set_style(style);
            pb
        } else {
            ProgressBar::hidden()
        };

        // Write to a temporary file and move it into place when complete
        let temp_path = local_path.with_extension("part");
        let downloaded = match write_body(&mut response, &temp_path, &pb).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                pb.abandon();
                if let Err(remove_err) = async_fs::remove_file(&temp_path).await {
                    warn!("Failed to remove {}: {}", temp_path.display(), remove_err);
                }
                return Err(e);
            }
        };

        async_fs::rename(&temp_path, &local_path).await?;

        pb.finish_with_message(format!("Saved {}", local_path.display()));
        info!("Saved {} bytes to {}", downloaded, local_path.display());

        Ok(local_path)
    }
}

async fn write_body(response: &mut reqwest::Response, path: &Path, pb: &ProgressBar) -> Result<u64> {
    let mut file = async_fs::File::create(path).await?;
    let mut downloaded = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    file.flush().await?;
    Ok(downloaded)
}
