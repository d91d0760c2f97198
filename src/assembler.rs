use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::{ChainState, EncryptionKey};
use crate::error::{DownloadError, SegmentFailure};
use crate::fetcher::FetchedSegment;
use crate::store::SegmentStore;

enum Pending {
    Memory(Bytes),
    Spilled,
    Failed(DownloadError),
}

/// What the assembler produced.
#[derive(Debug)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub written: usize,
    pub bytes_written: u64,
    /// Sorted by index.
    pub failures: Vec<SegmentFailure>,
}

impl AssemblyReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn missing(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

/// 分段合并器：按序号顺序解密并写入输出文件
///
/// Segments arrive in any order. Each one waits until every lower index has
/// been written or recorded as failed. Encrypted segments then go through the
/// cipher chain; clear ones are copied as they are. At most `window` waiting
/// segments stay in memory; the rest are spilled to the segment store.
pub struct Assembler {
    total: usize,
    next: usize,
    /// Per-index flag: the segment is part of the cipher chain.
    encrypted: Vec<bool>,
    /// The chain's last segment, the only one carrying padding.
    last_encrypted: Option<usize>,
    chain: Option<ChainState>,
    broken_at: Option<usize>,
    pending: BTreeMap<usize, Pending>,
    in_memory: usize,
    window: usize,
    spill: SegmentStore,
    output: BufWriter<File>,
    output_path: PathBuf,
    written: usize,
    bytes_written: u64,
    failures: Vec<SegmentFailure>,
}

impl Assembler {
    /// `encrypted` has one flag per playlist index. Flags are ignored when
    /// there is no key.
    pub async fn create(
        output_path: &Path,
        encrypted: Vec<bool>,
        key: Option<&EncryptionKey>,
        spill: SegmentStore,
        window: usize,
    ) -> Result<Self, DownloadError> {
        let file = File::create(output_path)
            .await
            .map_err(|e| DownloadError::io(output_path, e))?;

        let total = encrypted.len();
        let encrypted = match key {
            Some(_) => encrypted,
            None => vec![false; total],
        };
        let last_encrypted = encrypted.iter().rposition(|&e| e);

        Ok(Self {
            total,
            next: 0,
            encrypted,
            last_encrypted,
            chain: key.map(ChainState::new),
            broken_at: None,
            pending: BTreeMap::new(),
            in_memory: 0,
            window,
            spill,
            output: BufWriter::new(file),
            output_path: output_path.to_path_buf(),
            written: 0,
            bytes_written: 0,
            failures: Vec::new(),
        })
    }

    /// Index of the next segment to be written.
    pub fn expected(&self) -> usize {
        self.next
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Takes one fetched segment. Only I/O errors are returned; segment
    /// failures are recorded.
    pub async fn accept(&mut self, fetched: FetchedSegment) -> Result<(), DownloadError> {
        let FetchedSegment { index, result, .. } = fetched;

        if index >= self.total || index < self.next || self.pending.contains_key(&index) {
            warn!("Ignoring unexpected or duplicate segment {}", index);
            return Ok(());
        }

        let entry = match result {
            Err(e) => Pending::Failed(e),
            Ok(data) if index == self.next || self.in_memory < self.window => {
                self.in_memory += 1;
                Pending::Memory(data)
            }
            Ok(data) => {
                if !self.spill.contains(index).await {
                    self.spill
                        .save(index, &data)
                        .await
                        .map_err(|e| DownloadError::io(self.spill.path(index), e))?;
                }
                debug!("Spilled segment {} (waiting for {})", index, self.next);
                Pending::Spilled
            }
        };
        self.pending.insert(index, entry);

        self.drain().await
    }

    async fn drain(&mut self) -> Result<(), DownloadError> {
        while let Some(entry) = self.pending.remove(&self.next) {
            self.settle(entry).await?;
        }
        Ok(())
    }

    async fn settle(&mut self, entry: Pending) -> Result<(), DownloadError> {
        let index = self.next;
        match entry {
            Pending::Memory(data) => {
                self.in_memory -= 1;
                self.write_segment(index, data).await?;
            }
            Pending::Spilled => {
                let path = self.spill.path(index);
                let data = self
                    .spill
                    .load(index)
                    .await
                    .map_err(|e| DownloadError::io(&path, e))?
                    .ok_or_else(|| {
                        DownloadError::io(
                            &path,
                            std::io::Error::new(std::io::ErrorKind::NotFound, "spilled segment vanished"),
                        )
                    })?;
                self.write_segment(index, data).await?;
            }
            Pending::Failed(err) => self.record_failure(index, &err),
        }
        self.next += 1;
        Ok(())
    }

    async fn write_segment(&mut self, index: usize, data: Bytes) -> Result<(), DownloadError> {
        let plain = if self.encrypted[index] {
            if let Some(at) = self.broken_at {
                let err = DownloadError::Decryption {
                    index,
                    reason: format!("cipher chain broken at index {}", at),
                };
                self.record_failure(index, &err);
                return Ok(());
            }
            self.decrypt(index, data)
        } else {
            Some(data.to_vec())
        };
        let Some(plain) = plain else {
            return Ok(());
        };

        self.output
            .write_all(&plain)
            .await
            .map_err(|e| DownloadError::io(&self.output_path, e))?;
        self.written += 1;
        self.bytes_written += plain.len() as u64;
        debug!("Wrote segment {} ({} bytes)", index, plain.len());
        Ok(())
    }

    /// Advances the chain by one segment; `None` when the segment was
    /// recorded as failed.
    fn decrypt(&mut self, index: usize, data: Bytes) -> Option<Vec<u8>> {
        match self.chain.take() {
            Some(state) => {
                let is_final = Some(index) == self.last_encrypted;
                match state.decrypt_segment(index, data.to_vec(), is_final) {
                    Ok((plain, next_state)) => {
                        self.chain = Some(next_state);
                        Some(plain)
                    }
                    Err(err) => {
                        self.record_failure(index, &err);
                        None
                    }
                }
            }
            None => {
                let err = DownloadError::Decryption {
                    index,
                    reason: "no cipher state".to_string(),
                };
                self.record_failure(index, &err);
                None
            }
        }
    }

    fn record_failure(&mut self, index: usize, err: &DownloadError) {
        error!("Segment {} dropped: {}", index, err);
        self.failures.push(SegmentFailure::from_error(index, err));
        if self.encrypted[index] && self.broken_at.is_none() {
            self.broken_at = Some(index);
        }
    }

    /// Marks every undelivered segment as failed, then flushes and closes
    /// the output.
    pub async fn finish(mut self) -> Result<AssemblyReport, DownloadError> {
        while self.next < self.total {
            let index = self.next;
            let entry = self.pending.remove(&index).unwrap_or_else(|| {
                Pending::Failed(DownloadError::SegmentFetch {
                    index,
                    url: String::new(),
                    reason: "segment was never delivered".to_string(),
                    retryable: false,
                })
            });
            self.settle(entry).await?;
        }

        self.output
            .flush()
            .await
            .map_err(|e| DownloadError::io(&self.output_path, e))?;
        self.output
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| DownloadError::io(&self.output_path, e))?;

        self.failures.sort_by_key(|f| f.index);
        info!(
            "Assembled {}/{} segments ({} bytes) into {:?}",
            self.written, self.total, self.bytes_written, self.output_path
        );

        Ok(AssemblyReport {
            output: self.output_path,
            written: self.written,
            bytes_written: self.bytes_written,
            failures: self.failures,
        })
    }

    /// 合并循环：接收下载结果直到通道关闭
    ///
    /// Cancellation wins over a closed channel: a cancelled run never
    /// finishes, even when the fetch pool hung up first.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<FetchedSegment>,
        token: &CancellationToken,
    ) -> Result<AssemblyReport, DownloadError> {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(fetched) => self.accept(fetched).await?,
                    None => break,
                },
            }
        }

        if token.is_cancelled() {
            warn!(
                "Assembly cancelled at segment {}/{} with {} segments buffered",
                self.expected(),
                self.total,
                self.buffered()
            );
            return Err(DownloadError::Cancelled);
        }
        self.finish().await
    }
}
