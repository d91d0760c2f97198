use bytes::Bytes;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::config::FetchConfig;
use crate::error::DownloadError;
use crate::playlist::SegmentRef;
use crate::retry::{is_retryable_reqwest_error, retry_with_backoff, RetryAction, RetryPolicy};
use crate::store::SegmentStore;

/// A finished fetch, successful or not, handed to the assembler.
#[derive(Debug)]
pub struct FetchedSegment {
    pub index: usize,
    /// Raw (possibly encrypted) segment bytes.
    pub result: Result<Bytes, DownloadError>,
    /// Served from the segment store instead of the network.
    pub cached: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub downloaded: usize,
    pub cached: usize,
    pub failed: usize,
}

/// 并发分段下载池
///
/// Fetches run as spawned tasks, at most `concurrency` at a time, and are
/// forwarded in completion order. One segment failing never stops the
/// others. Tasks still in flight when the pool stops are aborted.
pub struct FetchPool {
    client: Client,
    config: FetchConfig,
    store: Option<SegmentStore>,
}

impl FetchPool {
    pub fn new(client: Client, config: FetchConfig) -> Self {
        Self {
            client,
            config,
            store: None,
        }
    }

    /// Reuse and persist ciphertext in `store`.
    pub fn with_store(mut self, store: SegmentStore) -> Self {
        self.store = Some(store);
        self
    }

    /// 下载所有分段
    pub async fn run(
        &self,
        segments: Vec<SegmentRef>,
        tx: mpsc::Sender<FetchedSegment>,
        token: CancellationToken,
    ) -> FetchSummary {
        let pb = progress_bar(segments.len() as u64, self.config.progress);
        let mut summary = FetchSummary::default();

        let fetches = stream::iter(segments)
            .map(|segment| {
                let client = self.client.clone();
                let retry = self.config.retry.clone();
                let store = self.store.clone();
                let token = token.clone();
                let index = segment.index;
                let url = segment.uri.to_string();

                let handle = AbortOnDropHandle::new(tokio::spawn(async move {
                    fetch_segment(&client, &segment, &retry, store.as_ref(), &token).await
                }));

                async move {
                    match handle.await {
                        Ok((result, cached)) => FetchedSegment {
                            index,
                            result,
                            cached,
                        },
                        Err(e) => FetchedSegment {
                            index,
                            result: Err(DownloadError::SegmentFetch {
                                index,
                                url,
                                reason: format!("fetch task failed: {}", e),
                                retryable: false,
                            }),
                            cached: false,
                        },
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));
        let mut fetches = Box::pin(fetches);

        loop {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("Fetch pool cancelled; abandoning outstanding downloads.");
                    break;
                }
                next = fetches.next() => match next {
                    Some(fetched) => fetched,
                    None => break,
                },
            };

            pb.inc(1);
            match &fetched.result {
                Ok(_) if fetched.cached => summary.cached += 1,
                Ok(_) => summary.downloaded += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!("Segment {} failed: {}", fetched.index, e);
                }
            }

            if tx.send(fetched).await.is_err() {
                warn!("Assembler stopped; abandoning outstanding downloads.");
                break;
            }
        }

        // aborts whatever is still running
        drop(fetches);
        pb.finish_with_message("downloaded");
        summary
    }
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn classify<T>(err: DownloadError) -> RetryAction<T> {
    if err.is_retryable() {
        RetryAction::Retry(err)
    } else {
        RetryAction::Fail(err)
    }
}

/// 下载单个分段（带重试），返回数据以及是否来自缓存
async fn fetch_segment(
    client: &Client,
    segment: &SegmentRef,
    retry: &RetryPolicy,
    store: Option<&SegmentStore>,
    token: &CancellationToken,
) -> (Result<Bytes, DownloadError>, bool) {
    let index = segment.index;

    if let Some(store) = store {
        match store.load(index).await {
            Ok(Some(data)) => {
                debug!("Segment {} already cached. Skipping.", index);
                return (Ok(data), true);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable cached segment {}: {}", index, e),
        }
    }

    let failed = |reason: String, retryable: bool| DownloadError::SegmentFetch {
        index,
        url: segment.uri.to_string(),
        reason,
        retryable,
    };

    let result = retry_with_backoff(retry, token, |_| {
        let request = client.get(segment.uri.clone());
        async move {
            let mut response = match request.send().await {
                Ok(r) => r,
                Err(e) => return classify(failed(e.to_string(), is_retryable_reqwest_error(&e))),
            };

            let status = response.status();
            if !status.is_success() {
                return classify(failed(
                    format!("HTTP {}", status),
                    DownloadError::is_retryable_status(status),
                ));
            }

            let mut data = Vec::new();
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(e) => return classify(failed(e.to_string(), true)),
                }
            }
            RetryAction::Success(Bytes::from(data))
        }
    })
    .await;

    if let (Ok(data), Some(store)) = (&result, store) {
        if !token.is_cancelled() {
            if let Err(e) = store.save(index, data).await {
                warn!("Failed to cache segment {}: {}", index, e);
            }
        }
    }

    (result, false)
}
