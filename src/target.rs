//! # Backup Targets
//!
//! The engine talks to every destination through [`BackupTarget`]. Two
//! strategies ship with the crate:
//!
//! - `network` ([`crate::network::NetworkTarget`]): a host reached over TCP
//! - `local` ([`crate::mirror::LocalTarget`]): a mounted directory such as an
//!   external drive
//!
//! Strategies are chosen by name through a [`TargetRegistry`], so new ones can
//! be registered without touching the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::mirror::LocalTarget;
use crate::network::{NetworkOptions, NetworkTarget};
use crate::protocol::FileStatus;
use crate::retry::RetryPolicy;
use crate::roots::BackupRoot;
use crate::status::StatusSender;

/// State of the target's copy of a file, relative to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStatus {
    pub status: FileStatus,
    pub timestamp: i64,
}

/// Outcome of [`BackupTarget::pull_missing`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MissingReport {
    pub pulled: usize,
    pub directories: usize,
    /// Local paths that could not be fetched.
    pub failed: Vec<PathBuf>,
}

#[async_trait]
pub trait BackupTarget: Send {
    fn name(&self) -> &str;

    /// Connects or mounts. Must succeed before any other operation.
    async fn prepare(&mut self) -> SyncResult<()>;

    fn check_ready(&self) -> bool;

    /// `false` means the target refused; the caller records a failed item.
    async fn create_directory(&mut self, root: &BackupRoot, dir: &Path) -> SyncResult<bool>;

    async fn get_status(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<RemoteStatus>;

    /// Fetches `file` and gives the local copy the target's timestamp.
    async fn pull_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<()>;

    /// `false` means the target refused the upload.
    async fn push_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<bool>;

    /// Fetches everything the target has under `root` that is absent locally.
    async fn pull_missing(&mut self, root: &BackupRoot) -> SyncResult<MissingReport>;

    async fn tear_down(&mut self);
}

/// Remote path of `local`, or an item-level error if it lies outside `root`.
pub fn remote_path(root: &BackupRoot, local: &Path) -> SyncResult<String> {
    root.remote_path_for(local).ok_or_else(|| {
        SyncError::fs(
            local,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is outside its backup root"),
        )
    })
}

/// One configured destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub kind: String,
    pub name: String,
    /// Destination directory for path-based strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl TargetEntry {
    pub fn network(name: impl Into<String>) -> Self {
        Self {
            kind: "network".into(),
            name: name.into(),
            path: None,
        }
    }

    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: "local".into(),
            name: name.into(),
            path: Some(path.into()),
        }
    }
}

/// Everything a factory may need to build a target.
#[derive(Debug, Clone, Default)]
pub struct TargetContext {
    pub network: Option<NetworkOptions>,
    pub retry: RetryPolicy,
    pub status: StatusSender,
}

pub type TargetFactory = fn(&TargetEntry, &TargetContext) -> SyncResult<Box<dyn BackupTarget>>;

pub struct TargetRegistry {
    factories: HashMap<String, TargetFactory>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("network", build_network);
        registry.register("local", build_local);
        registry
    }
}

impl TargetRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &str, factory: TargetFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, entry: &TargetEntry, ctx: &TargetContext) -> SyncResult<Box<dyn BackupTarget>> {
        let factory = self.factories.get(&entry.kind).ok_or_else(|| {
            SyncError::Config(format!(
                "unknown target kind '{}' (known: {})",
                entry.kind,
                self.kinds().join(", ")
            ))
        })?;
        factory(entry, ctx)
    }
}

fn build_network(entry: &TargetEntry, ctx: &TargetContext) -> SyncResult<Box<dyn BackupTarget>> {
    let options = ctx
        .network
        .clone()
        .ok_or_else(|| SyncError::Config(format!("target '{}' needs [network] settings", entry.name)))?;
    Ok(Box::new(NetworkTarget::new(
        entry.name.clone(),
        options,
        ctx.retry,
        ctx.status.clone(),
    )))
}

fn build_local(entry: &TargetEntry, ctx: &TargetContext) -> SyncResult<Box<dyn BackupTarget>> {
    let path = entry
        .path
        .clone()
        .ok_or_else(|| SyncError::Config(format!("target '{}' needs a path", entry.name)))?;
    Ok(Box::new(LocalTarget::new(entry.name.clone(), path, ctx.status.clone())))
}
