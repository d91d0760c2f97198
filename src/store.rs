use bytes::Bytes;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// 任务工作目录，每个分段一个文件（`index{N}.ts`）
///
/// Holds cached ciphertext from the fetch pool and segments the assembler
/// spills out of memory. Files are written to a `.part` sibling first and
/// renamed, so a file that exists under its final name is complete.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("index{}.ts", index))
    }

    pub async fn create(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    pub async fn contains(&self, index: usize) -> bool {
        fs::metadata(self.path(index)).await.is_ok()
    }

    /// Returns `None` when the segment is not stored.
    pub async fn load(&self, index: usize) -> std::io::Result<Option<Bytes>> {
        match fs::read(self.path(index)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, index: usize, data: &[u8]) -> std::io::Result<()> {
        let path = self.path(index);
        let part = path.with_extension("ts.part");

        let mut file = fs::File::create(&part).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&part, &path).await?;
        debug!("Stored segment {} at {:?}", index, path);
        Ok(())
    }

    pub async fn remove(&self, index: usize) -> std::io::Result<()> {
        match fs::remove_file(self.path(index)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// 清理工作目录
    pub async fn cleanup(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove {:?}: {}", self.dir, e);
                Err(e)
            }
        }
    }
}
