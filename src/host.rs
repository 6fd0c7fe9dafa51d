//! # Host Dispatcher
//!
//! Accepts client connections and answers their requests against a storage
//! root. Each connection runs in its own task; connections share nothing but
//! the read-only [`HostContext`].
//!
//! Requests are served strictly in order:
//!
//! | Request | Reply |
//! |---|---|
//! | `CREATE_DIRECTORY` | `SUCCESS` / `FAILED` |
//! | `GET_STATUS` | `GET_STATUS` with status and host mtime |
//! | `SEND_FILE` | `RECEIVE_FILE` + file body, or `FAILED` |
//! | `RECEIVE_FILE` (+ body) | `SUCCESS` / `FAILED` |
//! | `SEND_FILE_LIST` | file list |
//! | `CLOSE` | connection closed |
//!
//! Every reply echoes the request's path so the client can match it to the
//! request. Peer paths never leave the storage root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, DEFAULT_CHUNK_SIZE, DEFAULT_READ_TIMEOUT};
use crate::error::{SyncError, SyncResult};
use crate::handshake::{host_handshake, HostAuth};
use crate::protocol::{Command, FileStatus, Packet};
use crate::status::{HostState, StatusEvent, StatusSender};
use crate::storage;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_BIND_RETRY: Duration = Duration::from_secs(30);

/// Read-only state shared by every connection handler.
pub struct HostContext {
    pub storage_root: PathBuf,
    pub auth: HostAuth,
    pub read_timeout: Duration,
    /// How long an authenticated client may stay silent between requests.
    pub idle_timeout: Duration,
    pub chunk_size: usize,
    pub status: StatusSender,
}

impl HostContext {
    pub fn new(storage_root: PathBuf, auth: HostAuth) -> Self {
        Self {
            storage_root,
            auth,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            status: StatusSender::disabled(),
        }
    }
}

/// Binds `addr`, retrying every `delay`. `None` attempts retries forever.
pub async fn bind_with_retry(addr: &str, delay: Duration, attempts: Option<u32>) -> SyncResult<TcpListener> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Listening on {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(e) => {
                if attempts.is_some_and(|max| attempt >= max) {
                    error!("Could not bind {} after {} attempts: {}", addr, attempt, e);
                    return Err(e.into());
                }
                warn!("Bind to {} failed ({}), retrying in {:?}", addr, e, delay);
                sleep(delay).await;
            }
        }
    }
}

/// Accepts connections forever, one task per client.
pub async fn serve(listener: TcpListener, ctx: Arc<HostContext>) -> SyncResult<()> {
    let port = listener.local_addr()?.port();
    ctx.status.send(StatusEvent::Host(HostState::Listening { port }));

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let channel = Channel::new(stream, addr.to_string())
                .with_read_timeout(ctx.read_timeout)
                .with_chunk_size(ctx.chunk_size);
            handle_connection(channel, &ctx).await;
        });
    }
}

/// Serves one client until it closes, goes idle or breaks the protocol.
pub async fn handle_connection<S>(mut channel: Channel<S>, ctx: &HostContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer = channel.peer().to_string();

    match host_handshake(&mut channel, &ctx.auth).await {
        Ok(user) => info!("Client {} authenticated{}", peer, display_user(&user)),
        Err(e) => {
            warn!("Rejected {}: {}", peer, e);
            channel.close().await;
            return;
        }
    }

    if !ctx.storage_root.is_dir() {
        error!("Storage root {} is not a directory", ctx.storage_root.display());
        channel.close().await;
        return;
    }

    ctx.status.send(StatusEvent::ClientConnected { peer: peer.clone() });

    loop {
        let request = match channel.receive_packet_within(ctx.idle_timeout).await {
            Ok(request) => request,
            Err(SyncError::Timeout) => {
                info!("Client {} idle for {:?}, closing", peer, ctx.idle_timeout);
                break;
            }
            Err(SyncError::ConnectionClosed) => {
                info!("Client {} disconnected", peer);
                break;
            }
            Err(e) => {
                warn!("Dropping client {}: {}", peer, e);
                break;
            }
        };

        if request.command == Command::Close {
            info!("Client {} closed the session", peer);
            break;
        }

        ctx.status.send(StatusEvent::ClientActivity {
            peer: peer.clone(),
            command: request.command,
            path: request.path.clone(),
        });

        if let Err(e) = dispatch(&mut channel, ctx, request).await {
            warn!("Dropping client {}: {}", peer, e);
            break;
        }
    }

    channel.close().await;
    ctx.status.send(StatusEvent::ClientDisconnected { peer });
}

fn display_user(user: &str) -> String {
    if user.is_empty() {
        String::new()
    } else {
        format!(" as '{}'", user)
    }
}

/// Answers one request. Errors returned here end the connection.
async fn dispatch<S>(channel: &mut Channel<S>, ctx: &HostContext, request: Packet) -> SyncResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = storage::resolve_relative(&ctx.storage_root, &request.path);

    match (request.command, target) {
        (Command::CreateDirectory, Some(path)) => {
            let reply = match fs::create_dir_all(&path).await {
                Ok(()) => Command::Success,
                Err(e) => {
                    warn!("Cannot create {}: {}", path.display(), e);
                    Command::Failed
                }
            };
            channel.send_packet(&request.with_command(reply)).await
        }
        (Command::GetStatus, Some(path)) => {
            let (status, timestamp) = local_status(&path, request.timestamp).await;
            channel
                .send_packet(&request.with_status(status).with_timestamp(timestamp))
                .await
        }
        (Command::SendFile, Some(path)) => send_file(channel, &path, request).await,
        (Command::ReceiveFile, Some(path)) => receive_file(channel, &path, request).await,
        (Command::SendFileList, Some(path)) => {
            let base = ctx.storage_root.clone();
            let listed = tokio::task::spawn_blocking(move || storage::list_tree(&base, &path))
                .await
                .unwrap_or_default();
            debug!("Listing {} entries for '{}'", listed.len(), request.path);
            channel.send_file_list(&listed).await
        }
        (Command::ReceiveFile, None) => {
            warn!("Refusing upload outside storage root: '{}'", request.path);
            channel.discard_file().await?;
            channel.send_packet(&request.with_command(Command::Failed)).await
        }
        (Command::SendFileList, None) => {
            warn!("Refusing listing outside storage root: '{}'", request.path);
            channel.send_file_list(Vec::<String>::new()).await
        }
        (command, path) => {
            if path.is_none() {
                warn!("Refusing path outside storage root: '{}'", request.path);
            } else {
                warn!("Unexpected request {:?}", command);
            }
            channel.send_packet(&request.with_command(Command::Failed)).await?;
            channel.clear_input();
            Ok(())
        }
    }
}

async fn local_status(path: &Path, requester_mtime: i64) -> (FileStatus, i64) {
    match fs::metadata(path).await {
        Ok(meta) => {
            let mtime = storage::modified_millis(&meta).unwrap_or(0);
            if meta.is_dir() {
                (FileStatus::Directory, mtime)
            } else {
                (FileStatus::compare(mtime, requester_mtime), mtime)
            }
        }
        Err(_) => (FileStatus::NotFound, 0),
    }
}

async fn send_file<S>(channel: &mut Channel<S>, path: &Path, request: Packet) -> SyncResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The file is opened before anything is promised to the client.
    let opened = match File::open(path).await {
        Ok(file) => match file.metadata().await {
            Ok(meta) if meta.is_file() => Some((file, meta)),
            _ => None,
        },
        Err(_) => None,
    };

    let Some((file, meta)) = opened else {
        debug!("Cannot serve {}", path.display());
        return channel.send_packet(&request.with_command(Command::Failed)).await;
    };

    let mtime = storage::modified_millis(&meta).unwrap_or(0);
    channel
        .send_packet(&request.with_command(Command::ReceiveFile).with_timestamp(mtime))
        .await?;
    channel.send_reader(file, meta.len()).await
}

async fn receive_file<S>(channel: &mut Channel<S>, path: &Path, request: Packet) -> SyncResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            debug!("Cannot create parent of {}: {}", path.display(), e);
        }
    }

    let reply = match channel.receive_file(path).await {
        Ok(bytes) => match storage::set_modified_millis(path, request.timestamp) {
            Ok(()) => {
                debug!("Stored {} ({} bytes)", path.display(), bytes);
                Command::Success
            }
            Err(e) => {
                warn!("Cannot set mtime of {}: {}", path.display(), e);
                Command::Failed
            }
        },
        Err(e @ SyncError::Filesystem { .. }) => {
            warn!("Cannot store {}: {}", path.display(), e);
            Command::Failed
        }
        Err(e) => return Err(e),
    };

    channel.send_packet(&request.with_command(reply)).await
}
