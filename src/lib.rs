//! # backsync
//!
//! Timestamp-driven backup of local directory trees to a remote host or a
//! mounted drive.
//!
//! A client walks each configured backup root, asks the target how its copy
//! of every file compares by modification time, and pushes or pulls according
//! to the root's [`roots::SyncPolicy`]. The host side answers those requests
//! over a small binary protocol on TCP, authenticated and optionally
//! encrypted.
//!
//! ## Core Modules
//!
//! - [`protocol`] - Packet and file-list wire format
//! - [`channel`] - Framed packet and file transfer over a byte stream
//! - [`crypto`] / [`handshake`] - Key exchange, credentials and session ciphers
//! - [`sync`] - The synchronization engine
//! - [`target`] - Backup target interface and registry ([`network`], [`mirror`])
//! - [`retry`] - Connection backoff and failed-item replay
//! - [`host`] - The request dispatcher run by the backup host
//! - [`status`] - Progress events for any front end
//! - [`config`] / [`cli`] - Configuration files and the command line
//!
//! ## Quick Start
//!
//! ```bash
//! # On the host
//! backsync keygen /etc/backsync/host.key
//! backsync host --config /etc/backsync/host.toml
//!
//! # On the client
//! backsync init
//! backsync add ~/Documents --policy push-only
//! backsync sync
//! ```

pub mod channel;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod host;
pub mod mirror;
pub mod network;
pub mod protocol;
pub mod retry;
pub mod roots;
pub mod status;
pub mod storage;
pub mod sync;
pub mod target;

pub use error::{SyncError, SyncResult};
pub use sync::SyncEngine;
