//! # Status Publication
//!
//! The engine and the host publish [`StatusEvent`]s; whoever renders
//! progress folds them into a [`StatusSnapshot`] with a
//! [`StatusAggregator`] and polls that snapshot at its own pace.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Syncing,
    Retrying,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Checking,
    Pushing,
    Pulling,
    CreatingDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Listening { port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Phase(Phase),
    Root(PathBuf),
    File { path: PathBuf, activity: Activity },
    Host(HostState),
    ClientConnected { peer: String },
    ClientActivity { peer: String, command: Command, path: String },
    ClientDisconnected { peer: String },
}

/// Cheap to clone. A disabled sender drops every event.
#[derive(Debug, Clone, Default)]
pub struct StatusSender {
    tx: Option<UnboundedSender<StatusEvent>>,
}

impl StatusSender {
    pub fn new() -> (Self, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    pub fn phase(&self, phase: Phase) {
        self.send(StatusEvent::Phase(phase));
    }

    pub fn file(&self, path: impl Into<PathBuf>, activity: Activity) {
        self.send(StatusEvent::File {
            path: path.into(),
            activity,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub current_root: Option<PathBuf>,
    pub current_file: Option<(PathBuf, Activity)>,
    pub host: Option<HostState>,
    /// Connected peers and the last request each one made.
    pub clients: BTreeMap<String, Option<String>>,
    pub events: u64,
}

#[derive(Clone, Default)]
pub struct StatusAggregator {
    snapshot: Arc<RwLock<StatusSnapshot>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.read().clone()
    }

    pub fn apply(&self, event: StatusEvent) {
        let mut snap = self.snapshot.write();
        snap.events += 1;
        match event {
            StatusEvent::Phase(phase) => {
                snap.phase = phase;
                if matches!(phase, Phase::Finished | Phase::Failed | Phase::Idle) {
                    snap.current_root = None;
                    snap.current_file = None;
                }
            }
            StatusEvent::Root(root) => {
                snap.current_root = Some(root);
                snap.current_file = None;
            }
            StatusEvent::File { path, activity } => snap.current_file = Some((path, activity)),
            StatusEvent::Host(state) => snap.host = Some(state),
            StatusEvent::ClientConnected { peer } => {
                snap.clients.insert(peer, None);
            }
            StatusEvent::ClientActivity { peer, command, path } => {
                snap.clients.insert(peer, Some(format!("{:?} {}", command, path)));
            }
            StatusEvent::ClientDisconnected { peer } => {
                snap.clients.remove(&peer);
            }
        }
    }

    /// Folds events until every sender is dropped.
    pub async fn run(self, mut rx: UnboundedReceiver<StatusEvent>) {
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
    }
}
