use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{FetchConfig, HttpConfig, JobConfig, TranscodeProfile};
use crate::job::{identifier_from_page_url, validate_identifier};
use crate::retry::RetryPolicy;

/// Download an HLS playlist into a single file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The M3U8 URL to download.
    #[arg(short, long)]
    pub url: String,

    /// Directory the output file is written to.
    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Output file name without extension. Defaults to a hash of the URL.
    #[arg(long, value_parser = parse_identifier)]
    pub id: Option<String>,

    /// Video page URL; its last path segment becomes the output name when --id is absent.
    #[arg(long)]
    pub page_url: Option<String>,

    /// Maximum number of concurrent downloads.
    #[arg(short, long, default_value_t = crate::config::DEFAULT_CONCURRENCY)]
    pub threads: usize,

    /// Retries per segment after the first attempt.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Output container extension.
    #[arg(long, default_value = crate::config::DEFAULT_CONTAINER_EXT)]
    pub ext: String,

    /// Transcode after download: 1 = remux, 2 = NVIDIA GPU, 3 = CPU.
    #[arg(long)]
    pub transcode: Option<TranscodeProfile>,

    /// Path to the FFmpeg executable.
    #[arg(long)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Do not keep downloaded segments for resuming.
    #[arg(long)]
    pub no_cache: bool,

    /// Hide the progress bar.
    #[arg(short, long)]
    pub quiet: bool,

    /// Custom HTTP header(s). E.g., -H "Cookie: mycookie"
    #[arg(short = 'H', long = "header", action = clap::ArgAction::Append)]
    pub headers: Vec<String>,
}

impl Args {
    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            http: HttpConfig {
                headers: self.headers.clone(),
                timeout: Duration::from_secs(self.timeout),
                ..HttpConfig::default()
            },
            fetch: FetchConfig {
                concurrency: self.threads.max(1),
                retry: RetryPolicy {
                    max_retries: self.retries,
                    ..RetryPolicy::default()
                },
                cache_segments: !self.no_cache,
                progress: !self.quiet,
            },
            container_ext: self.ext.trim_start_matches('.').to_string(),
            transcode: self.transcode,
            ..JobConfig::default()
        }
    }

    pub fn identifier(&self) -> Option<String> {
        self.id
            .clone()
            .or_else(|| self.page_url.as_deref().and_then(identifier_from_page_url))
    }
}

fn parse_identifier(s: &str) -> Result<String, String> {
    validate_identifier(s).map_err(|e| e.to_string())
}

pub fn parse_args() -> Args {
    Args::parse()
}
