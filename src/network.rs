//! # Network Target
//!
//! Client side of the wire protocol. One connection per run, strictly one
//! request in flight at a time.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

use crate::channel::{Channel, DEFAULT_CHUNK_SIZE, DEFAULT_READ_TIMEOUT};
use crate::error::{SyncError, SyncResult};
use crate::handshake::{client_handshake, ClientAuth};
use crate::protocol::{to_local_separators, Command, FileStatus, Packet};
use crate::retry::{retry_connect, RetryPolicy};
use crate::roots::BackupRoot;
use crate::status::{Phase, StatusSender};
use crate::storage;
use crate::target::{remote_path, BackupTarget, MissingReport, RemoteStatus};

#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// `host:port`
    pub address: String,
    pub auth: ClientAuth,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

impl NetworkOptions {
    pub fn new(address: impl Into<String>, auth: ClientAuth) -> Self {
        Self {
            address: address.into(),
            auth,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

pub struct NetworkTarget {
    name: String,
    options: NetworkOptions,
    retry: RetryPolicy,
    status: StatusSender,
    channel: Option<Channel>,
}

impl NetworkTarget {
    pub fn new(name: String, options: NetworkOptions, retry: RetryPolicy, status: StatusSender) -> Self {
        Self {
            name,
            options,
            retry,
            status,
            channel: None,
        }
    }

    fn channel(&mut self) -> SyncResult<&mut Channel> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel),
            None => Err(SyncError::NotReady(self.name.clone())),
        }
    }

    /// Sends `request` and returns its reply, turning `FAILED` into a refusal.
    ///
    /// A reply must carry `expected` (or `FAILED`) and echo the request path;
    /// anything else belongs to another request and the stream is out of step.
    async fn request(&mut self, request: Packet, expected: Command) -> SyncResult<Packet> {
        let channel = self.channel()?;
        channel.send_packet(&request).await?;
        let response = channel.receive_packet().await?;
        check_reply(&request, &response, expected)?;
        if response.command == Command::Failed {
            return Err(SyncError::Refused {
                command: request.command,
                path: request.path,
            });
        }
        Ok(response)
    }

    /// Drops the connection after any error that leaves it unusable, so no
    /// later request can read a reply meant for an earlier one.
    async fn settle<T>(&mut self, result: SyncResult<T>) -> SyncResult<T> {
        let broken = matches!(&result, Err(e) if e.breaks_connection());
        if broken {
            if let Some(mut channel) = self.channel.take() {
                warn!("Dropping connection to {}; it is out of step", channel.peer());
                channel.close().await;
            }
        }
        result
    }

    async fn pull_remote(&mut self, remote: String, local: &Path) -> SyncResult<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await.map_err(|e| SyncError::fs(parent, e))?;
        }

        let response = self
            .request(Packet::new(Command::SendFile, remote), Command::ReceiveFile)
            .await?;

        let bytes = self.channel()?.receive_file(local).await?;
        storage::set_modified_millis(local, response.timestamp).map_err(|e| SyncError::fs(local, e))?;
        debug!("Pulled {} ({} bytes)", local.display(), bytes);
        Ok(())
    }

    async fn remote_status(&mut self, remote: String, timestamp: i64) -> SyncResult<RemoteStatus> {
        let response = self
            .request(
                Packet::new(Command::GetStatus, remote).with_timestamp(timestamp),
                Command::GetStatus,
            )
            .await?;
        Ok(RemoteStatus {
            status: response.status,
            timestamp: response.timestamp,
        })
    }

    async fn upload(&mut self, request: &Packet, source: File, len: u64) -> SyncResult<bool> {
        let channel = self.channel()?;
        channel.send_packet(request).await?;
        channel.send_reader(source, len).await?;

        let response = channel.receive_packet().await?;
        check_reply(request, &response, Command::Success)?;
        Ok(response.command == Command::Success)
    }

    async fn fetch_missing(&mut self, root: &BackupRoot) -> SyncResult<MissingReport> {
        let channel = self.channel()?;
        channel
            .send_packet(&Packet::new(Command::SendFileList, root.remote_name()))
            .await?;
        let listed = channel.receive_file_list().await?;
        debug!("Host lists {} entries under '{}'", listed.len(), root.remote_name());

        let mut report = MissingReport::default();
        for remote in listed {
            let Some(local) = root.local_path_for(&remote) else {
                warn!("Ignoring listed path outside '{}': {}", root.remote_name(), remote);
                continue;
            };
            if storage::is_hidden(&local) || fs::symlink_metadata(&local).await.is_ok() {
                continue;
            }

            let outcome = match self.remote_status(remote.clone(), 0).await {
                Ok(RemoteStatus {
                    status: FileStatus::Directory,
                    ..
                }) => fs::create_dir_all(&local)
                    .await
                    .map(|_| report.directories += 1)
                    .map_err(|e| SyncError::fs(&local, e)),
                Ok(RemoteStatus {
                    status: FileStatus::NotFound,
                    ..
                }) => Ok(()),
                Ok(_) => self.pull_remote(remote, &local).await.map(|_| report.pulled += 1),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_retryable_item() => {
                    warn!("Could not fetch missing {}: {}", local.display(), e);
                    report.failed.push(local);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl BackupTarget for NetworkTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&mut self) -> SyncResult<()> {
        if self.channel.is_some() {
            return Ok(());
        }

        let address = self.options.address.clone();
        let options = self.options.clone();
        self.status.phase(Phase::Connecting);

        let channel = retry_connect(&self.retry, &address, |attempt| {
            let options = options.clone();
            async move {
                debug!("Connecting to {} (attempt {})", options.address, attempt);
                let mut channel = Channel::connect(&options.address)
                    .await?
                    .with_read_timeout(options.read_timeout)
                    .with_chunk_size(options.chunk_size);
                client_handshake(&mut channel, &options.auth).await?;
                Ok(channel)
            }
        })
        .await?;

        info!("Connected to {} ({} transform)", address, channel.transform_name());
        self.channel = Some(channel);
        Ok(())
    }

    fn check_ready(&self) -> bool {
        self.channel.is_some()
    }

    async fn create_directory(&mut self, root: &BackupRoot, dir: &Path) -> SyncResult<bool> {
        let remote = remote_path(root, dir)?;
        let result = match self
            .request(Packet::new(Command::CreateDirectory, remote), Command::Success)
            .await
        {
            Ok(_) => Ok(true),
            Err(SyncError::Refused { .. }) => Ok(false),
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    async fn get_status(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<RemoteStatus> {
        let remote = remote_path(root, file)?;
        let local_mtime = storage::mtime_of(file).await.map_err(|e| SyncError::fs(file, e))?;
        let result = self.remote_status(remote, local_mtime).await;
        self.settle(result).await
    }

    async fn pull_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<()> {
        let remote = remote_path(root, file)?;
        let result = self.pull_remote(remote, file).await;
        self.settle(result).await
    }

    async fn push_file(&mut self, root: &BackupRoot, file: &Path) -> SyncResult<bool> {
        let remote = remote_path(root, file)?;

        // Everything that can fail locally happens before the request goes out.
        let source = File::open(file).await.map_err(|e| SyncError::fs(file, e))?;
        let meta = source.metadata().await.map_err(|e| SyncError::fs(file, e))?;
        let mtime = storage::modified_millis(&meta).map_err(|e| SyncError::fs(file, e))?;

        let request = Packet::new(Command::ReceiveFile, remote).with_timestamp(mtime);
        let result = self.upload(&request, source, meta.len()).await;
        self.settle(result).await
    }

    async fn pull_missing(&mut self, root: &BackupRoot) -> SyncResult<MissingReport> {
        let result = self.fetch_missing(root).await;
        self.settle(result).await
    }

    async fn tear_down(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.force_send_packet(&Packet::reply(Command::Close)).await;
            channel.close().await;
            info!("Disconnected from {}", channel.peer());
        }
    }
}

/// Accepts `expected` or `FAILED`, for the same path as `request`.
fn check_reply(request: &Packet, response: &Packet, expected: Command) -> SyncResult<()> {
    let command_ok = response.command == expected || response.command == Command::Failed;
    if !command_ok || response.path != to_local_separators(&request.path) {
        debug!("Reply {} does not answer {}", response, request);
        return Err(SyncError::UnexpectedResponse {
            request: request.command,
            got: response.command,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn status_request(path: &str) -> Packet {
        Packet::new(Command::GetStatus, path).with_timestamp(1_000)
    }

    #[test]
    fn test_reply_for_same_path_is_accepted() {
        let request = status_request("docs/a.txt");
        let reply = request.clone().with_status(FileStatus::NewVersion);
        assert!(check_reply(&request, &reply, Command::GetStatus).is_ok());
        let refused = request.clone().with_command(Command::Failed);
        assert!(check_reply(&request, &refused, Command::GetStatus).is_ok());
    }

    #[test]
    fn test_late_reply_for_other_path_is_rejected() {
        let request = status_request("docs/b.txt");
        let stale = status_request("docs/a.txt").with_status(FileStatus::NotFound);
        assert_matches!(
            check_reply(&request, &stale, Command::GetStatus),
            Err(SyncError::UnexpectedResponse {
                request: Command::GetStatus,
                got: Command::GetStatus,
            })
        );
    }

    #[test]
    fn test_reply_with_wrong_command_is_rejected() {
        let request = Packet::new(Command::ReceiveFile, "docs/b.txt");
        let stale = status_request("docs/b.txt");
        let err = check_reply(&request, &stale, Command::Success).unwrap_err();
        assert!(err.breaks_connection());
    }

    #[tokio::test]
    async fn test_requests_without_connection_are_not_ready() {
        let mut target = NetworkTarget::new(
            "host".into(),
            NetworkOptions::new(
                "127.0.0.1:1",
                ClientAuth::Legacy {
                    password: "pw".into(),
                    cipher_key: None,
                },
            ),
            RetryPolicy::default(),
            StatusSender::disabled(),
        );
        assert!(!target.check_ready());
        assert_matches!(
            target.request(status_request("a"), Command::GetStatus).await,
            Err(SyncError::NotReady(_))
        );
    }
}
