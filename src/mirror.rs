//! # Local Mirror Target
//!
//! Backs roots up into a directory on a mounted drive instead of a remote
//! host. Layout matches the host's storage root: each root lives under
//! `<destination>/<remote name>/`, so a drive can be swapped for a host (or
//! seeded from one) without changes.
//!
//! Copies go through a sibling `.temp` file and are renamed into place. Every
//! copy carries the source's modification time.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::FileStatus;
use crate::roots::BackupRoot;
use crate::status::{Phase, StatusSender};
use crate::storage;
use crate::target::{remote_path, BackupTarget, MissingReport, RemoteStatus};

pub struct LocalTarget {
    name: String,
    destination: PathBuf,
    status: StatusSender,
    ready: bool,
}

impl LocalTarget {
    pub fn new(name: String, destination: PathBuf, status: StatusSender) -> Self {
        Self {
            name,
            destination,
            status,
            ready: false,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn mirrored(&self, root: &BackupRoot, local: &Path) -> SyncResult<PathBuf> {
        let remote = remote_path(root, local)?;
        storage::resolve_relative(&self.destination, &remote).ok_or_else(|| {
            SyncError::fs(
                local,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "unmappable path"),
            )
        })
    }

    fn ensure_ready(&self) -> SyncResult<()> {
        if self.ready {
            Ok(())
        } else {
            Err(SyncError::NotReady(self.name.clone()))
        }
    }
}

/// Copies `from` over `to` through `<to>.temp` and stamps `to` with `from`'s mtime.
async fn copy_with_mtime(from: &Path, to: &Path) -> SyncResult<u64> {
    let meta = fs::metadata(from).await.map_err(|e| SyncError::fs(from, e))?;
    let mtime = storage::modified_millis(&meta).map_err(|e| SyncError::fs(from, e))?;

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await.map_err(|e| SyncError::fs(parent, e))?;
    }

    let staging = storage::temp_sibling(to);
    let copied = match fs::copy(from, &staging).await {
        Ok(copied) => copied,
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            return Err(SyncError::fs(to, e));
        }
    };

    storage::set_modified_millis(&staging, mtime).map_err(|e| SyncError::fs(&staging, e))?;
    if let Err(e) = fs::rename(&staging, to).await {
        let _ = fs::remove_file(&staging).await;
        return Err(SyncError::fs(to, e));
    }

    Ok(copied)
}

#[async_trait]
impl BackupTarget for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&mut self) -> SyncResult<()> {
        self.status.phase(Phase::Connecting);
        match fs::metadata(&self.destination).await {
            Ok(meta) if meta.is_dir() => {
                info!("Using {} at {}", self.name, self.destination.display());
                self.ready = true;
                Ok(())
            }
            _ => {
                warn!("Destination {} is not mounted or not a directory", self.destination.display());
                Err(SyncError::NotReady(self.name.clone()))
            }
        }
    }

    fn check_ready(&self) -> bool {
        self.ready && self.destination.is_dir()
    }

    async fn create_directory(&mut self, root: &BackupRoot, dir: &Path) -> SyncResult<bool> {
        self.ensure_ready()?;
        let mirrored = self.mirrored(root, dir)?;
        match fs::create_dir_all(&mirrored).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Cannot create {}: {}", mirrored.display(), e);
                Ok(false)
            }
        }
    }

    async fn get_status(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<RemoteStatus> {
        self.ensure_ready()?;
        let local_mtime = storage::mtime_of(file).await.map_err(|e| SyncError::fs(file, e))?;
        let mirrored = self.mirrored(root, file)?;

        let meta = match fs::metadata(&mirrored).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RemoteStatus {
                    status: FileStatus::NotFound,
                    timestamp: 0,
                })
            }
            Err(e) => return Err(SyncError::fs(&mirrored, e)),
        };

        let timestamp = storage::modified_millis(&meta).map_err(|e| SyncError::fs(&mirrored, e))?;
        let status = if meta.is_dir() {
            FileStatus::Directory
        } else {
            FileStatus::compare(timestamp, local_mtime)
        };
        Ok(RemoteStatus { status, timestamp })
    }

    async fn pull_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<()> {
        self.ensure_ready()?;
        let mirrored = self.mirrored(root, file)?;
        let bytes = copy_with_mtime(&mirrored, file).await?;
        debug!("Restored {} ({} bytes)", file.display(), bytes);
        Ok(())
    }

    async fn push_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<bool> {
        self.ensure_ready()?;
        let mirrored = self.mirrored(root, file)?;
        let bytes = copy_with_mtime(file, &mirrored).await?;
        debug!("Copied {} -> {} ({} bytes)", file.display(), mirrored.display(), bytes);
        Ok(true)
    }

    async fn pull_missing(&mut self, root: &BackupRoot) -> SyncResult<MissingReport> {
        self.ensure_ready()?;
        let base = self.destination.clone();
        let tree = base.join(root.remote_name());
        let listed = tokio::task::spawn_blocking(move || storage::list_tree(&base, &tree))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let mut report = MissingReport::default();
        for remote in listed {
            let Some(local) = root.local_path_for(&remote) else {
                continue;
            };
            if fs::symlink_metadata(&local).await.is_ok() {
                continue;
            }
            let Some(mirrored) = storage::resolve_relative(&self.destination, &remote) else {
                continue;
            };

            let outcome = if mirrored.is_dir() {
                fs::create_dir_all(&local)
                    .await
                    .map(|_| report.directories += 1)
                    .map_err(|e| SyncError::fs(&local, e))
            } else {
                copy_with_mtime(&mirrored, &local).await.map(|_| report.pulled += 1)
            };

            if let Err(e) = outcome {
                warn!("Could not restore {}: {}", local.display(), e);
                report.failed.push(local);
            }
        }

        Ok(report)
    }

    async fn tear_down(&mut self) {
        self.ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::SyncPolicy;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: BackupRoot,
        target: LocalTarget,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("docs");
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&drive).unwrap();

        let root = BackupRoot::new(&source, SyncPolicy::ALL, None).unwrap();
        let mut target = LocalTarget::new("usb".into(), drive.canonicalize().unwrap(), StatusSender::disabled());
        target.prepare().await.unwrap();
        Fixture { _dir: dir, root, target }
    }

    #[tokio::test]
    async fn test_prepare_fails_when_unmounted() {
        let dir = TempDir::new().unwrap();
        let mut target = LocalTarget::new("usb".into(), dir.path().join("absent"), StatusSender::disabled());
        assert!(target.prepare().await.is_err());
        assert!(!target.check_ready());
    }

    #[tokio::test]
    async fn test_push_then_status_is_same_version() {
        let mut f = fixture().await;
        let file = f.root.path.join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        storage::set_modified_millis(&file, 1_700_000_000_000).unwrap();

        let before = f.target.get_status(&f.root, &file).await.unwrap();
        assert_eq!(before.status, FileStatus::NotFound);

        assert!(f.target.push_file(&f.root, &file).await.unwrap());
        let mirrored = f.target.destination().join("docs").join("a.txt");
        assert_eq!(std::fs::read(&mirrored).unwrap(), b"hello");
        assert!(!storage::temp_sibling(&mirrored).exists());

        let after = f.target.get_status(&f.root, &file).await.unwrap();
        assert_eq!(after.status, FileStatus::SameVersion);
        assert_eq!(after.timestamp, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_status_compares_timestamps() {
        let mut f = fixture().await;
        let file = f.root.path.join("b.txt");
        std::fs::write(&file, b"local").unwrap();
        storage::set_modified_millis(&file, 2_000).unwrap();

        let mirrored = f.target.destination().join("docs").join("b.txt");
        std::fs::create_dir_all(mirrored.parent().unwrap()).unwrap();
        std::fs::write(&mirrored, b"remote").unwrap();

        storage::set_modified_millis(&mirrored, 3_000).unwrap();
        assert_eq!(f.target.get_status(&f.root, &file).await.unwrap().status, FileStatus::NewVersion);

        storage::set_modified_millis(&mirrored, 1_000).unwrap();
        assert_eq!(f.target.get_status(&f.root, &file).await.unwrap().status, FileStatus::OldVersion);
    }

    #[tokio::test]
    async fn test_pull_file_restores_timestamp() {
        let mut f = fixture().await;
        let mirrored = f.target.destination().join("docs").join("c.txt");
        std::fs::create_dir_all(mirrored.parent().unwrap()).unwrap();
        std::fs::write(&mirrored, b"backup").unwrap();
        storage::set_modified_millis(&mirrored, 5_000_123).unwrap();

        let file = f.root.path.join("c.txt");
        f.target.pull_file(&f.root, &file).await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"backup");
        assert_eq!(storage::mtime_of(&file).await.unwrap(), 5_000_123);
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let mut f = fixture().await;
        let dir = f.root.path.join("sub");
        assert!(f.target.create_directory(&f.root, &dir).await.unwrap());
        assert!(f.target.create_directory(&f.root, &dir).await.unwrap());
        assert!(f.target.destination().join("docs").join("sub").is_dir());
    }

    #[tokio::test]
    async fn test_pull_missing() {
        let mut f = fixture().await;
        let drive_docs = f.target.destination().join("docs");
        std::fs::create_dir_all(drive_docs.join("nested")).unwrap();
        std::fs::write(drive_docs.join("nested").join("n.txt"), b"n").unwrap();
        std::fs::write(drive_docs.join("present.txt"), b"remote").unwrap();
        std::fs::write(f.root.path.join("present.txt"), b"local").unwrap();

        let report = f.target.pull_missing(&f.root).await.unwrap();
        assert_eq!(report.directories, 1);
        assert_eq!(report.pulled, 1);
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read(f.root.path.join("nested").join("n.txt")).unwrap(), b"n");
        assert_eq!(std::fs::read(f.root.path.join("present.txt")).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_operations_require_prepare() {
        let dir = TempDir::new().unwrap();
        let root = BackupRoot::new(dir.path(), SyncPolicy::ALL, None).unwrap();
        let mut target = LocalTarget::new("usb".into(), dir.path().to_path_buf(), StatusSender::disabled());
        assert!(matches!(
            target.create_directory(&root, &root.path).await,
            Err(SyncError::NotReady(_))
        ));
    }
}
