use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_CONTAINER_EXT: &str = "mp4";
pub const DEFAULT_REORDER_WINDOW: usize = 32;

/// HTTP客户端配置
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    /// 形如 "Name: value" 的自定义请求头
    pub headers: Vec<String>,
    /// 单个请求的超时时间
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// 分段下载池配置
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// 将密文分段缓存到工作目录，便于断点续传
    pub cache_segments: bool,
    pub progress: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            cache_segments: true,
            progress: true,
        }
    }
}

/// Everything a job needs, fixed before it starts.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub http: HttpConfig,
    pub fetch: FetchConfig,
    /// Extension of the assembled file, without the dot.
    pub container_ext: String,
    /// Out-of-order segments kept in memory before spilling to disk.
    pub reorder_window: usize,
    pub keep_segments_on_failure: bool,
    pub transcode: Option<TranscodeProfile>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            fetch: FetchConfig::default(),
            container_ext: DEFAULT_CONTAINER_EXT.to_string(),
            reorder_window: DEFAULT_REORDER_WINDOW,
            keep_segments_on_failure: true,
            transcode: None,
        }
    }
}

/// 转档方案
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeProfile {
    /// 仅转换封装格式（无损）
    Remux = 1,
    /// NVIDIA GPU 转档
    Gpu = 2,
    /// CPU 转档
    Cpu = 3,
}

impl FromStr for TranscodeProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "remux" | "copy" => Ok(TranscodeProfile::Remux),
            "2" | "gpu" | "nvenc" => Ok(TranscodeProfile::Gpu),
            "3" | "cpu" | "x264" => Ok(TranscodeProfile::Cpu),
            other => Err(format!("unknown transcode profile `{}` (expected 1, 2 or 3)", other)),
        }
    }
}

impl fmt::Display for TranscodeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TranscodeProfile::Remux => "remux",
            TranscodeProfile::Gpu => "gpu",
            TranscodeProfile::Cpu => "cpu",
        };
        f.write_str(name)
    }
}
