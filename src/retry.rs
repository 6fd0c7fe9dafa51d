//! # Retry and Recovery
//!
//! Two levels of recovery: whole-connection retries with exponential backoff
//! ([`retry_connect`]), and per-item failures collected in a [`FailedQueue`]
//! that the engine replays once at the end of a run.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::roots::{BackupRoot, FailedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `attempt` until it succeeds or `max_attempts` attempts have failed.
///
/// Rejected credentials are returned at once; retrying cannot fix them.
pub async fn retry_connect<T, F, Fut>(policy: &RetryPolicy, addr: &str, mut attempt: F) -> SyncResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let max = policy.max_attempts.max(1);

    for n in 1..=max {
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    info!("Connected to {} on attempt {}", addr, n);
                }
                return Ok(value);
            }
            Err(SyncError::AuthenticationFailed) => return Err(SyncError::AuthenticationFailed),
            Err(e) => {
                warn!("Connection attempt {}/{} to {} failed: {}", n, max, addr, e);
                if n < max {
                    sleep(policy.delay_for(n)).await;
                }
            }
        }
    }

    Err(SyncError::ConnectFailed {
        addr: addr.to_string(),
        attempts: max,
    })
}

/// Items that failed during the primary pass of a run.
#[derive(Debug, Default)]
pub struct FailedQueue {
    items: Vec<FailedItem>,
}

impl FailedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: FailedItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queues a whole root, replacing anything already queued under it.
    pub fn push_root(&mut self, root: &BackupRoot) {
        self.items.retain(|item| item.root.path != root.path);
        self.items.push(FailedItem::new(&root.path, root));
    }

    /// Empties the queue, returning its items in insertion order.
    pub fn drain(&mut self) -> Vec<FailedItem> {
        std::mem::take(&mut self.items)
    }
}
