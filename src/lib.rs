pub mod assembler;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fetcher;
pub mod handoff;
pub mod http;
pub mod job;
pub mod playlist;
pub mod retry;
pub mod store;

pub use config::{FetchConfig, HttpConfig, JobConfig, TranscodeProfile};
pub use error::{DownloadError, FailureKind, JobError, SegmentFailure, Stage};
pub use job::{Downloader, JobReport, JobRequest, JobStatus};
pub use tokio_util::sync::CancellationToken;

use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use url::Url;

use crate::cli::Args;
use crate::handoff::FfmpegTranscoder;

/// 运行下载器的主要逻辑，返回任务的最终状态
pub async fn run(args: Args) -> Result<JobStatus> {
    let playlist_url = Url::parse(&args.url)?;

    let mut downloader = Downloader::new(args.job_config())?;
    if args.transcode.is_some() {
        let transcoder = FfmpegTranscoder::new(args.ffmpeg_path.as_deref());
        downloader = downloader.with_transcoder(Arc::new(transcoder));
    }

    let mut request = JobRequest::new(playlist_url, &args.output_dir);
    if let Some(id) = args.identifier() {
        request = request.with_identifier(id);
    }
    info!("Output will be saved to: {:?}", args.output_dir);

    // Ctrl+C 取消任务并清理临时文件
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job...");
            interrupt.cancel();
        }
    });

    let report = downloader.run(request, token).await?;

    if report.skipped {
        info!("Nothing to do, {:?} already exists.", report.output);
    } else {
        info!(
            "{}/{} segments written ({} downloaded, {} from cache).",
            report.written, report.total_segments, report.downloaded, report.cached
        );
    }

    if report.status == JobStatus::PartiallyFailed {
        error!("Missing segments:");
        for failure in &report.failures {
            error!(" - {}", failure);
        }
        error!("Partial output left at {:?}; re-run to retry the missing segments.", report.output);
    }
    for problem in &report.post_process_errors {
        warn!("Post-processing: {}", problem);
    }

    Ok(report.status)
}
