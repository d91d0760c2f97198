use reqwest::StatusCode;
use std::fmt;
use std::path::PathBuf;

/// Errors produced by the download pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("malformed playlist: {reason}")]
    MalformedPlaylist { reason: String },

    #[error("failed to fetch playlist {url}: {reason}")]
    PlaylistFetch { url: String, reason: String },

    #[error("failed to fetch key {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("segment {index} fetch failed ({url}): {reason}")]
    SegmentFetch {
        index: usize,
        url: String,
        reason: String,
        retryable: bool,
    },

    #[error("segment {index} decryption failed: {reason}")]
    Decryption { index: usize, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    AssemblyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("invalid header `{header}`: {reason}")]
    InvalidHeader { header: String, reason: String },

    #[error("invalid output identifier `{identifier}`: {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("transcode failed: {reason}")]
    Transcode { reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::AssemblyIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DownloadError::MalformedPlaylist {
            reason: reason.into(),
        }
    }

    /// 5xx, 408 and 429 are worth another attempt; other statuses are not.
    pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
    }

    /// Only segment fetch failures can be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::SegmentFetch { retryable: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

/// Orchestrator state in which a job was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    KeyFetch,
    Fetching,
    Assembling,
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::KeyFetch => "key-fetch",
            Stage::Fetching => "fetching",
            Stage::Assembling => "assembling",
            Stage::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// A fatal failure that aborted the whole job.
#[derive(Debug, thiserror::Error)]
#[error("job `{identifier}` aborted during {stage}: {source}")]
pub struct JobError {
    pub identifier: String,
    pub stage: Stage,
    #[source]
    pub source: DownloadError,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SegmentFetch,
    Decryption,
}

/// One segment that did not make it into the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub index: usize,
    pub kind: FailureKind,
    pub cause: String,
}

impl SegmentFailure {
    pub(crate) fn from_error(index: usize, err: &DownloadError) -> Self {
        let kind = match err {
            DownloadError::Decryption { .. } => FailureKind::Decryption,
            _ => FailureKind::SegmentFetch,
        };
        SegmentFailure {
            index,
            kind,
            cause: err.to_string(),
        }
    }
}

impl fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{:?}] {}", self.index, self.kind, self.cause)
    }
}
