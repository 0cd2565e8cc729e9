use async_trait::async_trait;
use chrono::{DateTime, Local};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::{debug, info, warn};

use crate::errors::ArchiveError;
use crate::retention::ArchiveNaming;

/// The snapshot produced by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub name: String,
    pub created_at: DateTime<Local>,
    pub source_dir: PathBuf,
    pub local_path: PathBuf,
    pub remote_path: Option<String>,
    pub size: u64,
}

/// What the builder hands back once the artifact is complete on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    pub path: PathBuf,
    pub size: u64,
    pub files: usize,
}

#[async_trait]
pub trait ArchiveBuilder: Send + Sync {
    async fn build(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveHandle, ArchiveError>;
}

/// Gzip-compressed tarball of every regular file under the source tree, minus
/// earlier archives of the same naming that live inside it.
#[derive(Debug, Clone)]
pub struct TarGzArchiver {
    compression: Compression,
    naming: ArchiveNaming,
}

impl TarGzArchiver {
    pub fn new(naming: ArchiveNaming) -> Self {
        Self {
            compression: Compression::default(),
            naming,
        }
    }
}

#[async_trait]
impl ArchiveBuilder for TarGzArchiver {
    async fn build(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveHandle, ArchiveError> {
        let source = source_dir.to_path_buf();
        let dest = dest.to_path_buf();
        let compression = self.compression;
        let naming = self.naming.clone();

        let handle =
            task::spawn_blocking(move || build_blocking(&source, &dest, compression, &naming))
                .await
                .map_err(|err| ArchiveError::Task(err.to_string()))??;

        info!(
            "archive written: {} ({} files, {} bytes)",
            handle.path.display(),
            handle.files,
            handle.size
        );
        Ok(handle)
    }
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn build_blocking(
    source: &Path,
    dest: &Path,
    compression: Compression,
    naming: &ArchiveNaming,
) -> Result<ArchiveHandle, ArchiveError> {
    if !source.is_dir() {
        return Err(ArchiveError::SourceMissing(source.to_path_buf()));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| ArchiveError::io("creating archive directory", e))?;
    }

    let partial = partial_path(dest);
    let _ = fs::remove_file(&partial);

    match write_tarball(source, dest, &partial, compression, naming) {
        Ok(files) => {
            fs::rename(&partial, dest).map_err(|e| {
                let _ = fs::remove_file(&partial);
                ArchiveError::io("moving archive into place", e)
            })?;
            let size = fs::metadata(dest)
                .map_err(|e| ArchiveError::io("reading archive size", e))?
                .len();
            Ok(ArchiveHandle {
                path: dest.to_path_buf(),
                size,
                files,
            })
        }
        Err(err) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove partial archive {}: {}", partial.display(), rm);
                }
            }
            Err(err)
        }
    }
}

/// True for an earlier archive, or the leftover of an interrupted one, sitting at
/// the root of the tree being archived.
fn is_archive_artifact(naming: &ArchiveNaming, name: &str) -> bool {
    naming.matches(name.strip_suffix(".partial").unwrap_or(name))
}

fn write_tarball(
    source: &Path,
    dest: &Path,
    partial: &Path,
    compression: Compression,
    naming: &ArchiveNaming,
) -> Result<usize, ArchiveError> {
    // Archives kept inside the tree they snapshot must not end up inside the next snapshot.
    let dest_dir = dest.parent().filter(|dir| dir.starts_with(source));
    let excluded = dest_dir.filter(|dir| *dir != source).map(Path::to_path_buf);
    let archives_at_root = dest_dir.is_some_and(|dir| dir == source);

    let file = fs::File::create(partial).map_err(|e| ArchiveError::io("creating archive file", e))?;
    let encoder = GzEncoder::new(file, compression);
    let mut tar = tar::Builder::new(encoder);
    tar.follow_symlinks(false);

    let mut files = 0usize;
    let walker = walkdir::WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match &excluded {
            Some(dir) => entry.path() != dir.as_path(),
            None => true,
        });

    for entry in walker {
        let entry = entry.map_err(|e| ArchiveError::Walk(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path == partial || path == dest {
            continue;
        }
        if archives_at_root
            && entry.depth() == 1
            && is_archive_artifact(naming, &entry.file_name().to_string_lossy())
        {
            debug!("skipping earlier archive {}", path.display());
            continue;
        }
        let rel = path.strip_prefix(source).unwrap_or(path);
        debug!("archiving {}", rel.display());
        tar.append_path_with_name(path, rel)
            .map_err(|e| ArchiveError::io("appending file to archive", e))?;
        files += 1;
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| ArchiveError::io("finishing tar stream", e))?;
    let file = encoder
        .finish()
        .map_err(|e| ArchiveError::io("finishing gzip stream", e))?;
    file.sync_all()
        .map_err(|e| ArchiveError::io("syncing archive file", e))?;

    Ok(files)
}
