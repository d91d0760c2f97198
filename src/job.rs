use log::{error, info, warn};
use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::assembler::Assembler;
use crate::config::JobConfig;
use crate::crypto::fetch_key;
use crate::error::{DownloadError, JobError, SegmentFailure, Stage};
use crate::fetcher::{FetchPool, FetchSummary};
use crate::handoff::{CoverExtractor, PageSnapshot, Transcoder};
use crate::http::build_http_client;
use crate::playlist::fetch_playlist;
use crate::store::SegmentStore;

/// One download: a playlist URL and where its output goes.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub playlist_url: Url,
    pub target_dir: PathBuf,
    /// Output file stem; derived from the playlist URL when absent.
    pub identifier: Option<String>,
    /// Page captured by the resolver, handed to cover extraction.
    pub page: Option<PageSnapshot>,
}

impl JobRequest {
    pub fn new(playlist_url: Url, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            playlist_url,
            target_dir: target_dir.into(),
            identifier: None,
            page: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_page(mut self, page: PageSnapshot) -> Self {
        self.page = Some(page);
        self
    }

    /// The output file stem. An explicit identifier that sanitizes to
    /// nothing usable is rejected.
    pub fn identifier(&self) -> Result<String, DownloadError> {
        match &self.identifier {
            Some(id) => validate_identifier(id),
            None => Ok(identifier_for_url(&self.playlist_url)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::PartiallyFailed => "partially failed",
            JobStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

impl JobError {
    pub fn status(&self) -> JobStatus {
        JobStatus::Aborted
    }
}

/// 任务结果汇总
#[derive(Debug, Clone)]
pub struct JobReport {
    pub identifier: String,
    pub status: JobStatus,
    /// Final output on success, the `.part` file otherwise.
    pub output: PathBuf,
    /// The output already existed and nothing was done.
    pub skipped: bool,
    pub total_segments: usize,
    pub written: usize,
    pub downloaded: usize,
    pub cached: usize,
    /// Sorted by index.
    pub failures: Vec<SegmentFailure>,
    pub duration_secs: f64,
    /// Post-processing problems; they do not change `status`.
    pub post_process_errors: Vec<String>,
}

impl JobReport {
    fn skipped(identifier: String, output: PathBuf) -> Self {
        Self {
            identifier,
            status: JobStatus::Succeeded,
            output,
            skipped: true,
            total_segments: 0,
            written: 0,
            downloaded: 0,
            cached: 0,
            failures: Vec::new(),
            duration_secs: 0.0,
            post_process_errors: Vec::new(),
        }
    }

    pub fn missing_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

/// First 12 hex digits of the SHA-256 of the playlist URL.
pub fn identifier_for_url(url: &Url) -> String {
    sha256::digest(url.as_str())[..12].to_string()
}

/// 从视频页面地址取得番号，例如 `https://host/videos/abc-123/` -> `abc-123`
pub fn identifier_from_page_url(page_url: &str) -> Option<String> {
    let path = match Url::parse(page_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => page_url.to_string(),
    };
    path.split('/')
        .filter(|s| !s.is_empty())
        .next_back()
        .and_then(|s| validate_identifier(s).ok())
}

/// Sanitizes `name` for use as a file stem; empty and dot-only names are
/// errors.
pub fn validate_identifier(name: &str) -> Result<String, DownloadError> {
    let sanitized = sanitize_identifier(name);
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(DownloadError::InvalidIdentifier {
            identifier: name.to_string(),
            reason: "must contain at least one character other than '.'".to_string(),
        });
    }
    Ok(sanitized)
}

fn sanitize_identifier(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

/// 下载器：串联播放列表解析、密钥获取、并发下载、合并与后处理
pub struct Downloader {
    client: Client,
    config: JobConfig,
    transcoder: Option<Arc<dyn Transcoder>>,
    cover: Option<Arc<dyn CoverExtractor>>,
}

impl Downloader {
    pub fn new(config: JobConfig) -> Result<Self, DownloadError> {
        let client = build_http_client(&config.http)?;
        Ok(Self {
            client,
            config,
            transcoder: None,
            cover: None,
        })
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn with_cover_extractor(mut self, cover: Arc<dyn CoverExtractor>) -> Self {
        self.cover = Some(cover);
        self
    }

    /// `<target>/<identifier>.<ext>`
    pub fn output_path(&self, target_dir: &Path, identifier: &str) -> PathBuf {
        target_dir.join(format!("{}.{}", identifier, self.config.container_ext))
    }

    pub fn partial_path(&self, target_dir: &Path, identifier: &str) -> PathBuf {
        target_dir.join(format!("{}.{}.part", identifier, self.config.container_ext))
    }

    pub fn work_dir(&self, target_dir: &Path, identifier: &str) -> PathBuf {
        target_dir.join(format!("{}.segments", identifier))
    }

    /// Runs one job to a terminal state.
    ///
    /// `Ok` carries `Succeeded` or `PartiallyFailed`; fatal failures and
    /// cancellation come back as `JobError` (`Aborted`).
    pub async fn run(&self, request: JobRequest, token: CancellationToken) -> Result<JobReport, JobError> {
        let identifier = match request.identifier() {
            Ok(id) => id,
            Err(source) => {
                error!("Job rejected: {}", source);
                return Err(JobError {
                    identifier: request.identifier.clone().unwrap_or_default(),
                    stage: Stage::Init,
                    source,
                });
            }
        };
        let abort = |stage: Stage, source: DownloadError| {
            error!("Job {} aborted during {}: {}", identifier, stage, source);
            JobError {
                identifier: identifier.clone(),
                stage,
                source,
            }
        };

        let target_dir = request.target_dir.as_path();
        let output = self.output_path(target_dir, &identifier);
        match fs::metadata(&output).await {
            Ok(meta) if meta.is_file() => {
                info!("Output {:?} already exists, skipping.", output);
                return Ok(JobReport::skipped(identifier.clone(), output));
            }
            Ok(_) => {
                let err = std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "output path exists and is not a regular file",
                );
                return Err(abort(Stage::Init, DownloadError::io(&output, err)));
            }
            Err(_) => {}
        }

        info!("Job {}: fetching playlist {}", identifier, request.playlist_url);
        fs::create_dir_all(target_dir)
            .await
            .map_err(|e| abort(Stage::Init, DownloadError::io(target_dir, e)))?;
        let playlist = tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            result = fetch_playlist(&self.client, request.playlist_url.clone()) => result,
        }
        .map_err(|e| abort(Stage::Init, e))?;
        info!(
            "Successfully parsed media playlist. Found {} segments ({:.1}s, {}).",
            playlist.len(),
            playlist.total_duration(),
            if playlist.is_encrypted() { "AES-128" } else { "clear" }
        );
        if !playlist.ended {
            warn!("Playlist has no #EXT-X-ENDLIST; downloading the segments listed so far.");
        }

        let key = match &playlist.key {
            Some(descriptor) => {
                info!("Job {}: fetching key", identifier);
                let key = fetch_key(&self.client, descriptor, &self.config.fetch.retry, &token)
                    .await
                    .map_err(|e| abort(Stage::KeyFetch, e))?;
                Some(key)
            }
            None => None,
        };

        info!("Job {}: downloading {} segments", identifier, playlist.len());
        let store = SegmentStore::new(self.work_dir(target_dir, &identifier));
        store
            .create()
            .await
            .map_err(|e| abort(Stage::Fetching, DownloadError::io(store.dir(), e)))?;

        let partial = self.partial_path(target_dir, &identifier);
        let assembler = Assembler::create(
            &partial,
            playlist.encryption_map(),
            key.as_ref(),
            store.clone(),
            self.config.reorder_window.max(1),
        )
        .await
        .map_err(|e| abort(Stage::Assembling, e))?;

        let mut pool = FetchPool::new(self.client.clone(), self.config.fetch.clone());
        if self.config.fetch.cache_segments {
            pool = pool.with_store(store.clone());
        }

        let pipeline = token.child_token();
        let (tx, rx) = mpsc::channel(self.config.fetch.concurrency.max(1));
        let fetching = pool.run(playlist.segments.clone(), tx, pipeline.clone());
        let assembling = async {
            let result = assembler.run(rx, &pipeline).await;
            if result.is_err() {
                pipeline.cancel();
            }
            result
        };
        let (summary, assembled): (FetchSummary, _) = tokio::join!(fetching, assembling);
        info!(
            "Job {}: fetched {} segments ({} from cache, {} failed)",
            identifier, summary.downloaded, summary.cached, summary.failed
        );

        // a cancelled pipeline never produces a report, whatever the assembler saw
        let assembled = match assembled {
            Ok(_) if pipeline.is_cancelled() => Err(DownloadError::Cancelled),
            other => other,
        };
        let assembled = match assembled {
            Ok(report) => report,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                let keep = !e.is_cancelled()
                    && self.config.fetch.cache_segments
                    && self.config.keep_segments_on_failure;
                if !keep {
                    let _ = store.cleanup().await;
                }
                let stage = if e.is_cancelled() {
                    Stage::Fetching
                } else {
                    Stage::Assembling
                };
                return Err(abort(stage, e));
            }
        };

        let mut report = JobReport {
            identifier: identifier.clone(),
            status: JobStatus::Succeeded,
            output: output.clone(),
            skipped: false,
            total_segments: playlist.len(),
            written: assembled.written,
            downloaded: summary.downloaded,
            cached: summary.cached,
            failures: assembled.failures,
            duration_secs: playlist.total_duration(),
            post_process_errors: Vec::new(),
        };

        if !report.failures.is_empty() {
            report.status = JobStatus::PartiallyFailed;
            report.output = partial;
            warn!(
                "Job {} partially failed: {} of {} segments missing {:?}. Partial output left at {:?}",
                identifier,
                report.failures.len(),
                report.total_segments,
                report.missing_indices(),
                report.output
            );
            if !(self.config.fetch.cache_segments && self.config.keep_segments_on_failure) {
                let _ = store.cleanup().await;
            }
            return Ok(report);
        }

        info!("Job {}: finalizing {:?}", identifier, output);
        fs::rename(&partial, &output)
            .await
            .map_err(|e| abort(Stage::Finalizing, DownloadError::io(&output, e)))?;
        match store.cleanup().await {
            Ok(()) => info!("Segment files cleaned up successfully."),
            Err(e) => error!("Failed to clean up some segment files: {}", e),
        }

        self.post_process(&request, &output, &mut report).await;
        info!("Job {} succeeded: {:?}", identifier, output);
        Ok(report)
    }

    async fn post_process(&self, request: &JobRequest, output: &Path, report: &mut JobReport) {
        if let (Some(cover), Some(page)) = (&self.cover, &request.page) {
            if let Err(e) = cover.extract_cover(page, &request.target_dir).await {
                error!("Cover extraction failed: {}", e);
                report.post_process_errors.push(e.to_string());
            }
        }

        if let (Some(transcoder), Some(profile)) = (&self.transcoder, self.config.transcode) {
            match transcoder.transcode(output, profile).await {
                Ok(()) => info!("Successfully transcoded {:?}", output),
                Err(e) => {
                    error!("Failed to transcode: {}", e);
                    report.post_process_errors.push(e.to_string());
                }
            }
        }
    }
}
