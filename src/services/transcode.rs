//! Voice recordings are normalized to MP3 with an external ffmpeg, when present.

use crate::config::AudioConfig;
use std::{path::Path, process::Stdio, sync::Arc};
use tempfile::NamedTempFile;
use tokio::{process::Command, sync::OnceCell};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AudioTranscoder {
    ffmpeg: String,
    enabled: bool,
    available: Arc<OnceCell<bool>>,
}

impl AudioTranscoder {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            enabled: config.transcode,
            available: Arc::new(OnceCell::new()),
        }
    }

    /// Checked once with `ffmpeg -version`.
    pub async fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        *self
            .available
            .get_or_init(|| async {
                let version = Command::new(&self.ffmpeg)
                    .arg("-version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                let ok = matches!(version, Ok(status) if status.success());
                if !ok {
                    warn!(
                        "{} is not available; recordings keep their original format",
                        self.ffmpeg
                    );
                }
                ok
            })
            .await
    }

    /// Convert `input` to MP3 in `work_dir`. `None` means keep the original:
    /// the encoder is missing, failed, or produced nothing.
    pub async fn to_mp3(&self, input: &Path, work_dir: &Path) -> Option<NamedTempFile> {
        if !self.is_available().await {
            return None;
        }
        let output = match tempfile::Builder::new()
            .prefix("vault-audio-")
            .suffix(".mp3")
            .tempfile_in(work_dir)
        {
            Ok(file) => file,
            Err(err) => {
                warn!("could not create transcode target: {}", err);
                return None;
            }
        };

        let result = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(input)
            .args([
                "-vn",
                "-acodec",
                "libmp3lame",
                "-ar",
                "44100",
                "-ac",
                "2",
                "-b:a",
                "128k",
                "-y",
            ])
            .arg(output.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(out) if out.status.success() => {
                let len = tokio::fs::metadata(output.path())
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                if len == 0 {
                    warn!("transcoding {} produced an empty file", input.display());
                    return None;
                }
                info!("transcoded {} to mp3 ({} bytes)", input.display(), len);
                Some(output)
            }
            Ok(out) => {
                warn!(
                    "ffmpeg failed on {}: {}",
                    input.display(),
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(err) => {
                warn!("could not run {}: {}", self.ffmpeg, err);
                None
            }
        }
    }
}
