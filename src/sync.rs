//! # Synchronization Engine
//!
//! Walks every backup root depth-first and asks the target, file by file,
//! how its copy compares to the local one. The root's [`SyncPolicy`] turns
//! that answer into a push, a pull or nothing.
//!
//! Failures are handled at two levels:
//!
//! - item-level errors (a refused upload, an unreadable file) record a
//!   [`FailedItem`] and the walk moves on; every failed item is replayed once
//!   after all roots are done
//! - a lost or out-of-step connection (a timeout included) stops the pass; the
//!   interrupted root and every root after it are queued, and the target is
//!   reconnected once before the replay
//! - any other connection-level error ends the run for that target
//!
//! [`SyncPolicy`]: crate::roots::SyncPolicy

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::Command;
use crate::retry::FailedQueue;
use crate::roots::{Action, BackupRoot, FailedItem};
use crate::status::{Activity, Phase, StatusEvent, StatusSender};
use crate::storage;
use crate::target::BackupTarget;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub target: String,
    pub pushed: usize,
    pub pulled: usize,
    pub skipped: usize,
    pub directories: usize,
    /// Items that still failed after the replay.
    pub failed: Vec<FailedItem>,
}

impl RunReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SyncEngine {
    status: StatusSender,
    failed: FailedQueue,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(StatusSender::disabled())
    }
}

impl SyncEngine {
    pub fn new(status: StatusSender) -> Self {
        Self {
            status,
            failed: FailedQueue::new(),
        }
    }

    /// Runs every root against every target, one target at a time.
    pub async fn run_all(
        &mut self,
        roots: &[BackupRoot],
        targets: &mut [Box<dyn BackupTarget>],
    ) -> Vec<(String, SyncResult<RunReport>)> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets.iter_mut() {
            let name = target.name().to_string();
            let result = self.run(roots, target.as_mut()).await;
            results.push((name, result));
        }
        results
    }

    /// One full run: prepare, walk every root, replay failures, tear down.
    pub async fn run(&mut self, roots: &[BackupRoot], target: &mut dyn BackupTarget) -> SyncResult<RunReport> {
        self.failed.drain();
        info!("Starting backup of {} roots to {}", roots.len(), target.name());

        if let Err(e) = target.prepare().await {
            error!("Target {} could not be prepared: {}", target.name(), e);
            self.status.phase(Phase::Failed);
            return Err(e);
        }
        if !target.check_ready() {
            self.status.phase(Phase::Failed);
            return Err(SyncError::NotReady(target.name().to_string()));
        }

        let result = self.run_prepared(roots, target).await;
        target.tear_down().await;

        match &result {
            Ok(report) => {
                info!(
                    "Backup to {} finished: {} pushed, {} pulled, {} skipped, {} directories, {} failed",
                    report.target,
                    report.pushed,
                    report.pulled,
                    report.skipped,
                    report.directories,
                    report.failed.len()
                );
                self.status.phase(Phase::Finished);
            }
            Err(e) => {
                error!("Backup to {} aborted: {}", target.name(), e);
                self.status.phase(Phase::Failed);
            }
        }
        result
    }

    async fn run_prepared(&mut self, roots: &[BackupRoot], target: &mut dyn BackupTarget) -> SyncResult<RunReport> {
        let mut report = RunReport::new(target.name());
        self.status.phase(Phase::Syncing);

        let mut lost = false;
        {
            let mut pass = Pass {
                target: &mut *target,
                status: &self.status,
                report: &mut report,
                failed: &mut self.failed,
            };
            for (index, root) in roots.iter().enumerate() {
                pass.status.send(StatusEvent::Root(root.path.clone()));
                match pass.sync_root(root).await {
                    Ok(()) => {}
                    Err(e) if e.breaks_connection() => {
                        warn!("Connection lost during {}: {}", root.path.display(), e);
                        for rest in &roots[index..] {
                            pass.failed.push_root(rest);
                        }
                        lost = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let replay = self.failed.drain();
        if replay.is_empty() {
            return Ok(report);
        }

        if lost {
            info!("Reconnecting to {} before retrying", target.name());
            target.tear_down().await;
            target.prepare().await?;
            if !target.check_ready() {
                return Err(SyncError::NotReady(target.name().to_string()));
            }
        }

        info!("Retrying {} failed items", replay.len());
        self.status.phase(Phase::Retrying);

        let mut second = FailedQueue::new();
        {
            let mut pass = Pass {
                target: &mut *target,
                status: &self.status,
                report: &mut report,
                failed: &mut second,
            };
            for (index, item) in replay.iter().enumerate() {
                match pass.replay(item).await {
                    Ok(()) => {}
                    Err(e) if e.breaks_connection() => {
                        warn!("Connection lost again during {}: {}", item.path.display(), e);
                        for rest in &replay[index..] {
                            pass.failed.push(rest.clone());
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        report.failed = second.drain();
        for item in &report.failed {
            warn!("Giving up on {}", item.path.display());
        }
        Ok(report)
    }
}

/// State for one pass over the roots.
struct Pass<'a> {
    target: &'a mut dyn BackupTarget,
    status: &'a StatusSender,
    report: &'a mut RunReport,
    failed: &'a mut FailedQueue,
}

impl<'a> Pass<'a> {
    /// Keeps item-level errors local, lets everything else through.
    fn absorb(&mut self, root: &BackupRoot, path: &Path, result: SyncResult<()>) -> SyncResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable_item() => {
                warn!("Failed {}: {}", path.display(), e);
                self.failed.push(FailedItem::new(path, root));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_root(&mut self, root: &BackupRoot) -> SyncResult<()> {
        self.walk(root, &root.path).await?;
        if root.policy.pull_missing {
            self.pull_missing(root).await?;
        }
        Ok(())
    }

    fn walk<'b>(
        &'b mut self,
        root: &'b BackupRoot,
        node: &'b Path,
    ) -> Pin<Box<dyn Future<Output = SyncResult<()>> + Send + 'b>> {
        Box::pin(async move {
            if node != root.path && storage::is_hidden(node) {
                return Ok(());
            }

            let meta = match fs::metadata(node).await {
                Ok(meta) => meta,
                Err(e) => return self.absorb(root, node, Err(SyncError::fs(node, e))),
            };

            if meta.is_dir() {
                let children = match storage::read_dir_sorted(node).await {
                    Ok(children) => children,
                    Err(e) => {
                        debug!("Skipping unreadable directory {}: {}", node.display(), e);
                        return Ok(());
                    }
                };

                self.status.file(node, Activity::CreatingDirectory);
                let created = self.target.create_directory(root, node).await;
                match created {
                    Ok(true) => self.report.directories += 1,
                    Ok(false) => {
                        let refused = Err(SyncError::Refused {
                            command: Command::CreateDirectory,
                            path: node.display().to_string(),
                        });
                        return self.absorb(root, node, refused);
                    }
                    Err(e) => return self.absorb(root, node, Err(e)),
                }

                for child in &children {
                    self.walk(root, child).await?;
                }
                Ok(())
            } else if meta.is_file() {
                let result = self.sync_file(root, node).await;
                self.absorb(root, node, result)
            } else {
                Ok(())
            }
        })
    }

    async fn sync_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<()> {
        self.status.file(file, Activity::Checking);
        let remote = self.target.get_status(root, file).await?;

        match root.policy.action_for(remote.status) {
            Action::Pull => {
                self.status.file(file, Activity::Pulling);
                self.target.pull_file(root, file).await?;
                self.report.pulled += 1;
                debug!("Pulled newer {}", file.display());
            }
            Action::Push => {
                self.status.file(file, Activity::Pushing);
                if !self.target.push_file(root, file).await? {
                    return Err(SyncError::Refused {
                        command: Command::ReceiveFile,
                        path: file.display().to_string(),
                    });
                }
                self.report.pushed += 1;
                debug!("Pushed {}", file.display());
            }
            Action::Skip => self.report.skipped += 1,
        }
        Ok(())
    }

    async fn pull_missing(&mut self, root: &BackupRoot) -> SyncResult<()> {
        self.status.file(&root.path, Activity::Pulling);
        let missing = match self.target.pull_missing(root).await {
            Ok(missing) => missing,
            Err(e) => return self.absorb(root, &root.path, Err(e)),
        };

        self.report.pulled += missing.pulled;
        self.report.directories += missing.directories;
        for path in missing.failed {
            self.failed.push(FailedItem::new(path, root));
        }
        Ok(())
    }

    /// Second and last attempt for an item that failed once.
    async fn replay(&mut self, item: &FailedItem) -> SyncResult<()> {
        let root = &item.root;

        if fs::symlink_metadata(&item.path).await.is_err() {
            // Only missing pulls fail on paths that do not exist locally.
            self.status.file(&item.path, Activity::Pulling);
            let result = self.target.pull_file(root, &item.path).await;
            if result.is_ok() {
                self.report.pulled += 1;
            }
            return self.absorb(root, &item.path, result);
        }

        self.walk(root, &item.path).await?;
        if item.is_root() && root.policy.pull_missing {
            self.pull_missing(root).await?;
        }
        Ok(())
    }
}
