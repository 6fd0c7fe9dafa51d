//! # Backup Roots and Policies
//!
//! A [`BackupRoot`] is one local directory tree the client keeps in sync,
//! together with the [`SyncPolicy`] that decides which way files may move and
//! the name the tree has on the remote side.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::protocol::FileStatus;
use crate::storage;

/// Which transfers are allowed for a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PolicyRepr", into = "PolicyRepr")]
pub struct SyncPolicy {
    pub push_most_recent: bool,
    pub pull_most_recent: bool,
    pub push_missing: bool,
    pub pull_missing: bool,
}

/// What the engine does with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Push,
    Pull,
    Skip,
}

impl SyncPolicy {
    pub const ALL: SyncPolicy = SyncPolicy::new(true, true, true, true);
    pub const PUSH_ONLY: SyncPolicy = SyncPolicy::new(true, false, true, false);
    pub const PULL_ONLY: SyncPolicy = SyncPolicy::new(false, true, false, true);
    pub const MISSING_ONLY: SyncPolicy = SyncPolicy::new(false, false, true, true);
    pub const CONTENTS_ONLY: SyncPolicy = SyncPolicy::new(true, true, false, false);

    const PRESETS: [(&'static str, SyncPolicy); 5] = [
        ("all", SyncPolicy::ALL),
        ("push-only", SyncPolicy::PUSH_ONLY),
        ("pull-only", SyncPolicy::PULL_ONLY),
        ("missing-only", SyncPolicy::MISSING_ONLY),
        ("contents-only", SyncPolicy::CONTENTS_ONLY),
    ];

    pub const fn new(push_most_recent: bool, pull_most_recent: bool, push_missing: bool, pull_missing: bool) -> Self {
        Self {
            push_most_recent,
            pull_most_recent,
            push_missing,
            pull_missing,
        }
    }

    /// Preset name, if these flags match one.
    pub fn name(&self) -> Option<&'static str> {
        Self::PRESETS.iter().find(|(_, p)| p == self).map(|(name, _)| *name)
    }

    /// `status` is the remote file's state relative to the local one.
    pub fn action_for(&self, status: FileStatus) -> Action {
        match status {
            FileStatus::NewVersion if self.pull_most_recent => Action::Pull,
            FileStatus::OldVersion if self.push_most_recent => Action::Push,
            FileStatus::NotFound if self.push_missing => Action::Push,
            _ => Action::Skip,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::ALL
    }
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::PRESETS
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, p)| *p)
            .ok_or_else(|| {
                let names: Vec<_> = Self::PRESETS.iter().map(|(n, _)| *n).collect();
                format!("unknown policy '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => {
                let flag = |b: bool| if b { '1' } else { '0' };
                write!(
                    f,
                    "custom({}{}{}{})",
                    flag(self.push_most_recent),
                    flag(self.pull_most_recent),
                    flag(self.push_missing),
                    flag(self.pull_missing)
                )
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PolicyRepr {
    Preset(String),
    Flags {
        push_most_recent: bool,
        pull_most_recent: bool,
        push_missing: bool,
        pull_missing: bool,
    },
}

impl TryFrom<PolicyRepr> for SyncPolicy {
    type Error = String;

    fn try_from(repr: PolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            PolicyRepr::Preset(name) => name.parse(),
            PolicyRepr::Flags {
                push_most_recent,
                pull_most_recent,
                push_missing,
                pull_missing,
            } => Ok(SyncPolicy::new(push_most_recent, pull_most_recent, push_missing, pull_missing)),
        }
    }
}

impl From<SyncPolicy> for PolicyRepr {
    fn from(policy: SyncPolicy) -> Self {
        match policy.name() {
            Some(name) => PolicyRepr::Preset(name.to_string()),
            None => PolicyRepr::Flags {
                push_most_recent: policy.push_most_recent,
                pull_most_recent: policy.pull_most_recent,
                push_missing: policy.push_missing,
                pull_missing: policy.pull_missing,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub policy: SyncPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
}

impl BackupRoot {
    /// The path must exist; it is stored in canonical form.
    pub fn new(path: impl AsRef<Path>, policy: SyncPolicy, remote_name: Option<String>) -> SyncResult<Self> {
        let path = path.as_ref();
        let path = path
            .canonicalize()
            .map_err(|e| SyncError::Config(format!("backup root {} is not usable: {}", path.display(), e)))?;

        if let Some(name) = &remote_name {
            validate_remote_name(name)?;
        }

        Ok(Self {
            path,
            policy,
            remote_name,
        })
    }

    /// Name of this tree on the remote side.
    pub fn remote_name(&self) -> String {
        if let Some(name) = &self.remote_name {
            return name.clone();
        }
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Remote relative path for a local path inside this root.
    pub fn remote_path_for(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.path).ok()?;
        if relative.as_os_str().is_empty() {
            return Some(self.remote_name());
        }
        let remote = Path::new(&self.remote_name()).join(relative);
        remote.to_str().map(str::to_owned)
    }

    /// Local path for a remote relative path, if it belongs to this root.
    pub fn local_path_for(&self, remote: &str) -> Option<PathBuf> {
        let mut components = Path::new(remote).components();
        match components.next() {
            Some(Component::Normal(first)) if first.to_str() == Some(self.remote_name().as_str()) => {}
            _ => return None,
        }
        let rest = components.as_path();
        storage::resolve_relative(&self.path, rest.to_str()?)
    }
}

fn validate_remote_name(name: &str) -> SyncResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SyncError::Config(format!(
            "remote name '{}' must be a single path component",
            name
        ))),
    }
}

/// A file or directory that failed during the primary pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub path: PathBuf,
    pub root: BackupRoot,
}

impl FailedItem {
    pub fn new(path: impl Into<PathBuf>, root: &BackupRoot) -> Self {
        Self {
            path: path.into(),
            root: root.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == self.root.path
    }
}
