use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

use crate::retention::RetentionEntry;

/// Local archive directory operations used by the retention pass.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Regular files directly inside `dir`. A missing directory lists as empty.
    async fn list(&self, dir: &Path) -> io::Result<Vec<RetentionEntry>>;

    async fn remove(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct FsLocalStore;

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn list(&self, dir: &Path) -> io::Result<Vec<RetentionEntry>> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(value) => value,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(RetentionEntry::new(name, metadata.modified()?));
        }
        Ok(entries)
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
