//! Post-processing collaborators invoked after a job succeeds.

use async_trait::async_trait;
use log::{debug, info};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

use crate::config::TranscodeProfile;
use crate::error::DownloadError;

/// Page content captured by whoever resolved the playlist URL.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub page_url: Option<String>,
    pub html: String,
}

/// Re-encodes or remuxes the assembled file in place.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, profile: TranscodeProfile) -> Result<(), DownloadError>;
}

/// Pulls a cover image out of the captured page into `target_dir`.
#[async_trait]
pub trait CoverExtractor: Send + Sync {
    async fn extract_cover(&self, page: &PageSnapshot, target_dir: &Path) -> Result<(), DownloadError>;
}

/// 使用 FFmpeg 转档
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        // 默认使用系统PATH中的ffmpeg
        Self::new(None)
    }
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: Option<&Path>) -> Self {
        let ffmpeg = match ffmpeg_path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from("ffmpeg"),
        };
        Self { ffmpeg }
    }
}

/// Sibling path the transcoder writes to before replacing the input.
pub(crate) fn transcode_temp_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}.transcode.{}", stem, ext.to_string_lossy()),
        None => format!("{}.transcode", stem),
    };
    input.with_file_name(name)
}

/// 构建ffmpeg参数
pub(crate) fn ffmpeg_args(input: &Path, output: &Path, profile: TranscodeProfile) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-i".into(), input.into()];
    let codec: &[&str] = match profile {
        TranscodeProfile::Remux => &["-c", "copy", "-bsf:a", "aac_adtstoasc"],
        TranscodeProfile::Gpu => &["-c:v", "h264_nvenc", "-b:v", "10000K", "-threads", "5"],
        TranscodeProfile::Cpu => &[
            "-c:v", "libx264", "-b:v", "3M", "-threads", "5", "-preset", "superfast",
        ],
    };
    args.extend(codec.iter().map(OsString::from));
    args.extend(["-movflags", "+faststart", "-y"].iter().map(OsString::from));
    args.push(output.into());
    args
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, profile: TranscodeProfile) -> Result<(), DownloadError> {
        let temp = transcode_temp_path(input);
        let args = ffmpeg_args(input, &temp, profile);
        info!("Transcoding {:?} with profile {}", input, profile);
        debug!("Running {:?} {:?}", self.ffmpeg, args);

        let status = Command::new(&self.ffmpeg)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DownloadError::Transcode {
                reason: format!("failed to run {:?}: {}. Is ffmpeg installed?", self.ffmpeg, e),
            })?;

        if !status.success() {
            let _ = fs::remove_file(&temp).await;
            return Err(DownloadError::Transcode {
                reason: format!("FFmpeg failed with exit code: {:?}", status.code()),
            });
        }

        fs::rename(&temp, input)
            .await
            .map_err(|e| DownloadError::io(input, e))?;
        Ok(())
    }
}
