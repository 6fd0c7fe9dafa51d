//! End-to-end tests: a real host on a loopback port and a client engine
//! driving a network target against it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use backsync::channel::Channel;
use backsync::crypto::HostKey;
use backsync::handshake::{host_handshake, ClientAuth, CredentialTable, HostAuth};
use backsync::host::{self, HostContext};
use backsync::mirror::LocalTarget;
use backsync::network::{NetworkOptions, NetworkTarget};
use backsync::protocol::{Command, FileStatus, Packet};
use backsync::retry::RetryPolicy;
use backsync::roots::{BackupRoot, SyncPolicy};
use backsync::status::{Phase, StatusAggregator, StatusSender};
use backsync::storage;
use backsync::{SyncEngine, SyncError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::net::TcpListener;

const T: i64 = 1_600_000_000_000;

struct Fixture {
    _dir: TempDir,
    client: PathBuf,
    storage: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let client = dir.path().join("client").join("docs");
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&client).unwrap();
        std::fs::create_dir_all(&storage).unwrap();
        Self {
            client: client.canonicalize().unwrap(),
            storage: storage.canonicalize().unwrap(),
            _dir: dir,
        }
    }

    fn root(&self, policy: SyncPolicy) -> BackupRoot {
        BackupRoot::new(&self.client, policy, None).unwrap()
    }
}

fn write_file(path: &Path, contents: &[u8], mtime: i64) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    storage::set_modified_millis(path, mtime).unwrap();
}

fn mtime(path: &Path) -> i64 {
    storage::modified_millis(&std::fs::metadata(path).unwrap()).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
    }
}

/// Starts a host on an ephemeral port and returns its address.
async fn start_host(storage: &Path, auth: HostAuth) -> String {
    let listener = host::bind_with_retry("127.0.0.1:0", Duration::from_millis(10), Some(1))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut ctx = HostContext::new(storage.to_path_buf(), auth);
    ctx.read_timeout = Duration::from_secs(5);
    ctx.idle_timeout = Duration::from_secs(5);
    ctx.chunk_size = 16;
    tokio::spawn(host::serve(listener, Arc::new(ctx)));
    addr
}

fn secure_pair() -> (HostAuth, HostKey) {
    let key = HostKey::generate();
    let users: CredentialTable = [("alice", "correct horse")].into_iter().collect();
    (
        HostAuth::Secure {
            key: key.clone(),
            users,
        },
        key,
    )
}

fn target(addr: &str, auth: ClientAuth) -> NetworkTarget {
    let mut options = NetworkOptions::new(addr, auth);
    options.read_timeout = Duration::from_secs(5);
    // Small chunks force multi-chunk transfers.
    options.chunk_size = 7;
    NetworkTarget::new("host".into(), options, fast_retry(), StatusSender::disabled())
}

async fn secure_target(fixture: &Fixture) -> NetworkTarget {
    let (auth, key) = secure_pair();
    let addr = start_host(&fixture.storage, auth).await;
    target(
        &addr,
        ClientAuth::Secure {
            host_key: key.public_key(),
            username: "alice".into(),
            password: "correct horse".into(),
        },
    )
}

#[tokio::test]
async fn test_push_only_backs_up_with_timestamps() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("x.txt"), b"the quick brown fox", T);
    write_file(&fixture.client.join("sub").join("y.txt"), b"jumps", T + 5);

    let mut target = secure_target(&fixture).await;
    let mut engine = SyncEngine::default();
    let report = engine
        .run(&[fixture.root(SyncPolicy::PUSH_ONLY)], &mut target)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.pushed, 2);
    assert_eq!(report.directories, 2);

    let stored = fixture.storage.join("docs").join("x.txt");
    assert_eq!(std::fs::read(&stored).unwrap(), b"the quick brown fox");
    assert_eq!(mtime(&stored), T);
    assert_eq!(mtime(&fixture.storage.join("docs").join("sub").join("y.txt")), T + 5);

    // A second run finds everything up to date.
    let report = engine
        .run(&[fixture.root(SyncPolicy::PUSH_ONLY)], &mut target)
        .await
        .unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn test_newer_host_copy_is_pulled() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("notes.txt"), b"old", T);
    write_file(&fixture.storage.join("docs").join("notes.txt"), b"newer on host", T + 1_000);

    let mut target = secure_target(&fixture).await;
    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::ALL)], &mut target)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.pulled, 1);
    let local = fixture.client.join("notes.txt");
    assert_eq!(std::fs::read(&local).unwrap(), b"newer on host");
    assert_eq!(mtime(&local), T + 1_000);
}

#[tokio::test]
async fn test_push_only_never_overwrites_newer_host_copy() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("notes.txt"), b"old", T);
    write_file(&fixture.storage.join("docs").join("notes.txt"), b"newer on host", T + 1_000);

    let mut target = secure_target(&fixture).await;
    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::PUSH_ONLY)], &mut target)
        .await
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(std::fs::read(fixture.client.join("notes.txt")).unwrap(), b"old");
    assert_eq!(std::fs::read(fixture.storage.join("docs").join("notes.txt")).unwrap(), b"newer on host");
}

#[tokio::test]
async fn test_pull_missing_restores_tree() {
    let fixture = Fixture::new();
    write_file(&fixture.storage.join("docs").join("lost.txt"), b"restore me", T);
    write_file(&fixture.storage.join("docs").join("deep").join("z.txt"), b"zzz", T + 7);
    write_file(&fixture.storage.join("docs").join(".hidden"), b"h", T);

    let mut target = secure_target(&fixture).await;
    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::MISSING_ONLY)], &mut target)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.pulled, 2);
    assert_eq!(std::fs::read(fixture.client.join("lost.txt")).unwrap(), b"restore me");
    assert_eq!(mtime(&fixture.client.join("deep").join("z.txt")), T + 7);
    assert!(!fixture.client.join(".hidden").exists());
}

#[tokio::test]
async fn test_legacy_mode_with_rolling_cipher() {
    let fixture = Fixture::new();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    write_file(&fixture.client.join("blob.bin"), &payload, T);

    let addr = start_host(
        &fixture.storage,
        HostAuth::Legacy {
            password: "letmein".into(),
            cipher_key: Some("rolling".into()),
        },
    )
    .await;
    let mut target = target(
        &addr,
        ClientAuth::Legacy {
            password: "letmein".into(),
            cipher_key: Some("rolling".into()),
        },
    );

    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::ALL)], &mut target)
        .await
        .unwrap();

    assert_eq!(report.pushed, 1);
    let stored = fixture.storage.join("docs").join("blob.bin");
    assert_eq!(std::fs::read(&stored).unwrap(), payload);
    assert_eq!(mtime(&stored), T);
}

#[tokio::test]
async fn test_wrong_password_is_not_retried() {
    let fixture = Fixture::new();
    let (auth, key) = secure_pair();
    let addr = start_host(&fixture.storage, auth).await;

    let mut target = target(
        &addr,
        ClientAuth::Secure {
            host_key: key.public_key(),
            username: "alice".into(),
            password: "wrong".into(),
        },
    );

    let (status, rx) = StatusSender::new();
    let aggregator = StatusAggregator::new();
    let task = tokio::spawn(aggregator.clone().run(rx));

    let mut engine = SyncEngine::new(status);
    let result = engine.run(&[fixture.root(SyncPolicy::ALL)], &mut target).await;
    assert_matches!(result, Err(SyncError::AuthenticationFailed));

    drop(engine);
    task.await.unwrap();
    assert_eq!(aggregator.snapshot().phase, Phase::Failed);
}

#[tokio::test]
async fn test_unreachable_host_gives_up_after_retries() {
    let fixture = Fixture::new();
    let addr = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().to_string()
    };

    let mut target = target(
        &addr,
        ClientAuth::Legacy {
            password: "pw".into(),
            cipher_key: None,
        },
    );
    let result = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::ALL)], &mut target)
        .await;
    assert_matches!(result, Err(SyncError::ConnectFailed { attempts: 2, .. }));
}

#[tokio::test]
async fn test_local_target_mirrors_like_a_host() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("a.txt"), b"alpha", T);
    write_file(&fixture.storage.join("docs").join("b.txt"), b"beta", T + 3);

    let mut target = LocalTarget::new("usb".into(), fixture.storage.clone(), StatusSender::disabled());
    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::ALL)], &mut target)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pulled, 1);
    assert_eq!(mtime(&fixture.storage.join("docs").join("a.txt")), T);
    assert_eq!(std::fs::read(fixture.client.join("b.txt")).unwrap(), b"beta");
}

#[tokio::test]
async fn test_file_root_is_backed_up() {
    let fixture = Fixture::new();
    let notes = fixture.client.parent().unwrap().join("notes.txt");
    write_file(&notes, b"remember the milk", T);
    let root = BackupRoot::new(&notes, SyncPolicy::ALL, None).unwrap();

    let mut target = secure_target(&fixture).await;
    let mut engine = SyncEngine::default();
    let report = engine.run(&[root.clone()], &mut target).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.directories, 0);
    let stored = fixture.storage.join("notes.txt");
    assert_eq!(std::fs::read(&stored).unwrap(), b"remember the milk");
    assert_eq!(mtime(&stored), T);

    let report = engine.run(&[root], &mut target).await.unwrap();
    assert_eq!((report.pushed, report.skipped), (0, 1));
}

#[tokio::test]
async fn test_host_without_storage_root_serves_nothing() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("a.txt"), b"alpha", T);
    let auth = HostAuth::Legacy {
        password: "pw".into(),
        cipher_key: None,
    };
    let addr = start_host(&fixture.storage.join("gone"), auth).await;

    let mut target = target(
        &addr,
        ClientAuth::Legacy {
            password: "pw".into(),
            cipher_key: None,
        },
    );
    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::PUSH_ONLY)], &mut target)
        .await
        .unwrap();

    assert_eq!(report.pushed, 0);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].is_root());
    assert!(!fixture.storage.join("gone").exists());
}

/// A legacy host that answers `GET_STATUS` late once for `slow`, reports
/// `b.txt` as newer than anything the client has, and records every request.
async fn start_slow_host(slow: &'static str, delay: Duration) -> (String, Arc<Mutex<Vec<(Command, PathBuf)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let delayed = Arc::new(AtomicBool::new(false));

    let log = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&log);
            let delayed = Arc::clone(&delayed);
            tokio::spawn(async move {
                let mut channel = Channel::new(stream, peer.to_string()).with_read_timeout(Duration::from_secs(5));
                let auth = HostAuth::Legacy {
                    password: "pw".into(),
                    cipher_key: None,
                };
                if host_handshake(&mut channel, &auth).await.is_err() {
                    return;
                }

                while let Ok(request) = channel.receive_packet().await {
                    let path = PathBuf::from(&request.path);
                    log.lock().push((request.command, path.clone()));

                    let reply = match request.command {
                        Command::Close => break,
                        Command::CreateDirectory => request.with_command(Command::Success),
                        Command::GetStatus => {
                            if path.ends_with(slow) && !delayed.swap(true, Ordering::SeqCst) {
                                tokio::time::sleep(delay).await;
                            }
                            if path.ends_with("b.txt") {
                                request.with_status(FileStatus::NewVersion).with_timestamp(T + 9_000)
                            } else {
                                request.with_status(FileStatus::NotFound).with_timestamp(0)
                            }
                        }
                        Command::ReceiveFile => {
                            if channel.discard_file().await.is_err() {
                                break;
                            }
                            request.with_command(Command::Success)
                        }
                        _ => request.with_command(Command::Failed),
                    };
                    if channel.send_packet(&reply).await.is_err() {
                        break;
                    }
                }
                channel.close().await;
            });
        }
    });

    (addr, requests)
}

#[tokio::test]
async fn test_late_reply_never_answers_next_request() {
    let fixture = Fixture::new();
    write_file(&fixture.client.join("a.txt"), b"alpha", T);
    write_file(&fixture.client.join("b.txt"), b"older than the host copy", T);

    let (addr, requests) = start_slow_host("a.txt", Duration::from_millis(450)).await;
    let mut options = NetworkOptions::new(
        &addr,
        ClientAuth::Legacy {
            password: "pw".into(),
            cipher_key: None,
        },
    );
    options.read_timeout = Duration::from_millis(300);
    let mut target = NetworkTarget::new("slow".into(), options, fast_retry(), StatusSender::disabled());

    let report = SyncEngine::default()
        .run(&[fixture.root(SyncPolicy::PUSH_ONLY)], &mut target)
        .await
        .unwrap();

    let uploads: Vec<PathBuf> = requests
        .lock()
        .iter()
        .filter(|(command, _)| *command == Command::ReceiveFile)
        .map(|(_, path)| path.clone())
        .collect();
    assert_eq!(uploads, vec![Path::new("docs").join("a.txt")]);
    assert!(report.is_clean());
    assert_eq!((report.pushed, report.skipped), (1, 1));
}
