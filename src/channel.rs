//! # Transport Channel
//!
//! One connection, one channel. The channel owns the stream and the traffic
//! [`Transform`] and offers the primitives both sides of the protocol are
//! built from:
//!
//! - length-prefixed packet frames (`[4B BE len][payload]`)
//! - size-prefixed file transfer (`[8B BE total]` followed by the body)
//! - the `0x0D`/`0xFF` file-list stream
//! - raw reads and writes for the handshake
//!
//! File bodies are a raw byte stream under unframed transforms and a run of
//! `[4B BE len][sealed chunk]` frames under the session cipher. Every read is
//! bounded by the read timeout.

use std::io;
use std::path::Path;
use std::time::Duration;

use futures::FutureExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::crypto::{Transform, TAG_LEN};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{decode_file_list, encode_file_list, DecodeError, Packet, LIST_TERMINATOR};
use crate::storage;

/// Largest packet payload accepted.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

/// Default plaintext size of one sealed file chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Hard ceiling for a single chunk frame.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Largest encoded file list accepted.
pub const MAX_LIST_LEN: usize = 64 * 1024 * 1024;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const FORCE_SEND_ATTEMPTS: u32 = 10;
const FORCE_SEND_DELAY: Duration = Duration::from_millis(10);
const STREAM_BUFFER: usize = 64 * 1024;

pub struct Channel<S = TcpStream> {
    stream: S,
    transform: Transform,
    read_timeout: Duration,
    chunk_size: usize,
    peer: String,
}

impl Channel<TcpStream> {
    pub async fn connect(addr: &str) -> SyncResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, addr))
    }
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            transform: Transform::Plain,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            peer: peer.into(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn set_transform(&mut self, transform: Transform) {
        debug!("Channel to {} switched to {} transform", self.peer, transform.name());
        self.transform = transform;
    }

    pub fn transform_name(&self) -> &'static str {
        self.transform.name()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    async fn read_wire_within(&mut self, buf: &mut [u8], limit: Duration) -> SyncResult<()> {
        match timeout(limit, self.stream.read_exact(buf)).await {
            Err(_) => Err(SyncError::Timeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(SyncError::ConnectionClosed),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) => {
                self.transform.decrypt_stream(buf);
                Ok(())
            }
        }
    }

    async fn read_wire(&mut self, buf: &mut [u8]) -> SyncResult<()> {
        self.read_wire_within(buf, self.read_timeout).await
    }

    async fn write_wire(&mut self, buf: &[u8]) -> SyncResult<()> {
        if matches!(self.transform, Transform::Rolling(_)) {
            let mut scrambled = buf.to_vec();
            self.transform.encrypt_stream(&mut scrambled);
            self.stream.write_all(&scrambled).await?;
        } else {
            self.stream.write_all(buf).await?;
        }
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> SyncResult<()> {
        self.write_wire(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_raw(&mut self, len: usize) -> SyncResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_wire(&mut buf).await?;
        Ok(buf)
    }

    /// Writes `[4B BE len][payload]`, sealing the payload under the session cipher.
    pub async fn write_frame(&mut self, payload: &[u8]) -> SyncResult<()> {
        let sealed = self.transform.seal(payload)?;
        let len = u32::try_from(sealed.len()).map_err(|_| DecodeError::FrameTooLarge {
            len: sealed.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = Vec::with_capacity(4 + sealed.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&sealed);
        self.write_wire(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one frame whose plaintext is at most `max` bytes.
    pub async fn read_frame(&mut self, max: usize) -> SyncResult<Vec<u8>> {
        let limit = self.read_timeout;
        self.read_frame_within(max, limit).await
    }

    async fn read_frame_within(&mut self, max: usize, header_limit: Duration) -> SyncResult<Vec<u8>> {
        let mut header = [0u8; 4];
        self.read_wire_within(&mut header, header_limit).await?;
        let len = u32::from_be_bytes(header) as usize;

        let max = if self.transform.is_framed() { max + TAG_LEN } else { max };
        if len > max {
            return Err(DecodeError::FrameTooLarge { len, max }.into());
        }

        let mut body = vec![0u8; len];
        self.read_wire(&mut body).await?;
        Ok(self.transform.open(&body)?)
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> SyncResult<()> {
        debug!("-> {} {}", self.peer, packet);
        self.write_frame(&packet.encode()).await
    }

    pub async fn receive_packet(&mut self) -> SyncResult<Packet> {
        let limit = self.read_timeout;
        self.receive_packet_within(limit).await
    }

    /// Like [`receive_packet`](Self::receive_packet), but waits up to `idle`
    /// for the frame to start. Used while a host waits for the next request.
    pub async fn receive_packet_within(&mut self, idle: Duration) -> SyncResult<Packet> {
        let payload = self.read_frame_within(MAX_PACKET_LEN, idle).await?;
        let packet = Packet::decode(&payload)?;
        debug!("<- {} {}", self.peer, packet);
        Ok(packet)
    }

    /// Best-effort send for shutdown paths; failures are only logged.
    pub async fn force_send_packet(&mut self, packet: &Packet) {
        for attempt in 1..=FORCE_SEND_ATTEMPTS {
            match self.send_packet(packet).await {
                Ok(()) => return,
                Err(e) => {
                    debug!("Send attempt {}/{} to {} failed: {}", attempt, FORCE_SEND_ATTEMPTS, self.peer, e);
                    sleep(FORCE_SEND_DELAY).await;
                }
            }
        }
        warn!("Giving up on sending {:?} to {}", packet.command, self.peer);
    }

    pub async fn send_file(&mut self, path: &Path) -> SyncResult<u64> {
        let file = File::open(path).await.map_err(|e| SyncError::fs(path, e))?;
        let total = file.metadata().await.map_err(|e| SyncError::fs(path, e))?.len();
        self.send_reader(file, total).await?;
        Ok(total)
    }

    /// Sends exactly `total` bytes from `reader`.
    pub async fn send_reader<R>(&mut self, reader: R, total: u64) -> SyncResult<()>
    where
        R: AsyncRead + Unpin,
    {
        self.write_wire(&total.to_be_bytes()).await?;
        let mut reader = reader.take(total);
        let mut remaining = total;

        if self.transform.is_framed() {
            while remaining > 0 {
                let want = remaining.min(self.chunk_size as u64) as usize;
                let mut chunk = vec![0u8; want];
                fill(&mut reader, &mut chunk).await?;
                self.write_frame(&chunk).await?;
                remaining -= want as u64;
            }
        } else {
            let mut buf = vec![0u8; STREAM_BUFFER];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                fill(&mut reader, &mut buf[..want]).await?;
                self.write_wire(&buf[..want]).await?;
                remaining -= want as u64;
            }
        }

        self.stream.flush().await?;
        Ok(())
    }

    /// Receives one file payload into `dest`.
    ///
    /// An existing `dest` is moved to `<name>.temp` first and only removed
    /// once the new content is complete; any failure removes the partial
    /// file and restores the previous one. Local write failures keep
    /// draining the declared payload so the stream stays usable.
    pub async fn receive_file(&mut self, dest: &Path) -> SyncResult<u64> {
        let mut header = [0u8; 8];
        self.read_wire(&mut header).await?;
        let total = u64::from_be_bytes(header);

        let backup = storage::temp_sibling(dest);
        let had_previous = fs::metadata(dest).await.map(|m| m.is_file()).unwrap_or(false);

        if had_previous {
            if let Err(e) = fs::rename(dest, &backup).await {
                self.receive_body(total, None).await?;
                return Err(SyncError::fs(dest, e));
            }
        }

        let mut file = match File::create(dest).await {
            Ok(file) => file,
            Err(e) => {
                let drained = self.receive_body(total, None).await;
                restore(dest, &backup, had_previous).await;
                drained?;
                return Err(SyncError::fs(dest, e));
            }
        };

        let outcome = self.receive_body(total, Some(&mut file)).await;
        let outcome = match outcome {
            Ok(None) => file.flush().await.map_err(|e| SyncError::fs(dest, e)),
            Ok(Some(write_err)) => Err(SyncError::fs(dest, write_err)),
            Err(e) => Err(e),
        };
        drop(file);

        match outcome {
            Ok(()) => {
                if had_previous {
                    if let Err(e) = fs::remove_file(&backup).await {
                        warn!("Failed to remove {}: {}", backup.display(), e);
                    }
                }
                Ok(total)
            }
            Err(e) => {
                let _ = fs::remove_file(dest).await;
                restore(dest, &backup, had_previous).await;
                Err(e)
            }
        }
    }

    /// Consumes and drops one file payload.
    pub async fn discard_file(&mut self) -> SyncResult<u64> {
        let mut header = [0u8; 8];
        self.read_wire(&mut header).await?;
        let total = u64::from_be_bytes(header);
        self.receive_body(total, None).await?;
        Ok(total)
    }

    /// Reads `total` body bytes, writing them to `sink` until a write fails.
    /// Returns the first local write error, if any.
    async fn receive_body(&mut self, total: u64, mut sink: Option<&mut File>) -> SyncResult<Option<io::Error>> {
        let mut remaining = total;
        let mut write_error = None;

        if self.transform.is_framed() {
            while remaining > 0 {
                let chunk = self.read_frame(MAX_CHUNK_SIZE).await?;
                if chunk.is_empty() || chunk.len() as u64 > remaining {
                    return Err(DecodeError::ChunkOverrun.into());
                }
                remaining -= chunk.len() as u64;
                write_error = write_or_drop(&mut sink, &chunk, write_error).await;
            }
        } else {
            let mut buf = vec![0u8; STREAM_BUFFER];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                self.read_wire(&mut buf[..want]).await?;
                remaining -= want as u64;
                write_error = write_or_drop(&mut sink, &buf[..want], write_error).await;
            }
        }

        Ok(write_error)
    }

    /// Reads one byte; `None` on any transport failure.
    pub async fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.read_wire(&mut byte).await {
            Ok(()) => Some(byte[0]),
            Err(e) => {
                debug!("Byte read from {} failed: {}", self.peer, e);
                None
            }
        }
    }

    pub async fn send_file_list<I, T>(&mut self, entries: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let encoded = encode_file_list(entries);
        if self.transform.is_framed() {
            self.write_frame(&encoded).await
        } else {
            self.write_raw(&encoded).await
        }
    }

    pub async fn receive_file_list(&mut self) -> SyncResult<Vec<String>> {
        if self.transform.is_framed() {
            let encoded = self.read_frame(MAX_LIST_LEN).await?;
            return Ok(decode_file_list(&encoded)?);
        }

        let mut encoded = Vec::new();
        loop {
            let byte = self.read_byte().await.ok_or(SyncError::ConnectionClosed)?;
            encoded.push(byte);
            if byte == LIST_TERMINATOR {
                break;
            }
            if encoded.len() > MAX_LIST_LEN {
                return Err(DecodeError::FrameTooLarge {
                    len: encoded.len(),
                    max: MAX_LIST_LEN,
                }
                .into());
            }
        }
        Ok(decode_file_list(&encoded)?)
    }

    /// Drops whatever input is already buffered without waiting for more.
    pub fn clear_input(&mut self) -> usize {
        let mut cleared = 0;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf).now_or_never() {
                Some(Ok(n)) if n > 0 => {
                    self.transform.decrypt_stream(&mut buf[..n]);
                    cleared += n;
                }
                _ => break,
            }
        }
        if cleared > 0 {
            debug!("Cleared {} pending bytes from {}", cleared, self.peer);
        }
        cleared
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of channel to {} failed: {}", self.peer, e);
        }
    }
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> SyncResult<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SyncError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "source shrank during transfer"))
        } else {
            SyncError::Io(e)
        }
    })?;
    Ok(())
}

async fn write_or_drop(sink: &mut Option<&mut File>, data: &[u8], previous: Option<io::Error>) -> Option<io::Error> {
    if previous.is_some() {
        return previous;
    }
    match sink {
        Some(file) => file.write_all(data).await.err(),
        None => None,
    }
}

async fn restore(dest: &Path, backup: &Path, had_previous: bool) {
    if had_previous {
        if let Err(e) = fs::rename(backup, dest).await {
            warn!("Failed to restore {} from {}: {}", dest.display(), backup.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{RollingCipher, Role, SessionCipher, SessionKey};
    use crate::protocol::{Command, FileStatus};
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (a, b) = duplex(1024 * 1024);
        (
            Channel::new(a, "a").with_read_timeout(Duration::from_secs(2)),
            Channel::new(b, "b").with_read_timeout(Duration::from_secs(2)),
        )
    }

    fn session_pair(chunk_size: usize) -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (mut a, mut b) = pair();
        let key = SessionKey::generate();
        a.set_transform(Transform::Session(SessionCipher::new(&key, Role::Client).unwrap()));
        b.set_transform(Transform::Session(SessionCipher::new(&key, Role::Host).unwrap()));
        (a.with_chunk_size(chunk_size), b.with_chunk_size(chunk_size))
    }

    fn rolling_pair() -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (mut a, mut b) = pair();
        a.set_transform(Transform::Rolling(RollingCipher::new(b"secret".to_vec()).unwrap()));
        b.set_transform(Transform::Rolling(RollingCipher::new(b"secret".to_vec()).unwrap()));
        (a, b)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_packet_exchange_all_transforms() {
        for (mut a, mut b) in [pair(), rolling_pair(), session_pair(1024)] {
            let packet = Packet::new(Command::GetStatus, "dir/file.txt")
                .with_timestamp(42)
                .with_status(FileStatus::OldVersion);
            a.send_packet(&packet).await.unwrap();
            let received = b.receive_packet().await.unwrap();
            assert_eq!(received.command, Command::GetStatus);
            assert_eq!(received.timestamp, 42);
            assert_eq!(received.status, FileStatus::OldVersion);

            b.send_packet(&Packet::reply(Command::Success)).await.unwrap();
            assert_eq!(a.receive_packet().await.unwrap().command, Command::Success);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = pair();
        a.write_raw(&((MAX_PACKET_LEN as u32) + 1).to_be_bytes()).await.unwrap();
        assert_matches!(
            b.receive_packet().await,
            Err(SyncError::Decode(DecodeError::FrameTooLarge { .. }))
        );
    }

    #[tokio::test]
    async fn test_read_timeout_breaks_connection() {
        let (_a, b) = pair();
        let mut b = b.with_read_timeout(Duration::from_millis(50));
        let err = b.receive_packet().await.unwrap_err();
        assert_matches!(err, SyncError::Timeout);
        assert!(err.breaks_connection());
    }

    #[tokio::test]
    async fn test_closed_peer_reported() {
        let (a, mut b) = pair();
        drop(a);
        assert_matches!(b.receive_packet().await, Err(SyncError::ConnectionClosed));
        assert_eq!(b.read_byte().await, None);
    }

    #[tokio::test]
    async fn test_file_transfer_all_transforms() {
        let dir = TempDir::new().unwrap();
        let data = sample(200_000);
        let src = dir.path().join("src.bin");
        std::fs::write(&src, &data).unwrap();

        // Chunk sizes around the payload length, including an exact multiple.
        for (i, (mut a, mut b)) in [pair(), rolling_pair(), session_pair(1000), session_pair(100_000), session_pair(1 << 20)]
            .into_iter()
            .enumerate()
        {
            let dest = dir.path().join(format!("dest-{}.bin", i));
            let src = src.clone();
            let sender = tokio::spawn(async move {
                a.send_file(&src).await.unwrap();
                a
            });
            let received = b.receive_file(&dest).await.unwrap();
            sender.await.unwrap();

            assert_eq!(received, data.len() as u64);
            assert_eq!(std::fs::read(&dest).unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_empty_file_transfer() {
        let dir = TempDir::new().unwrap();
        let (mut a, mut b) = session_pair(16);
        let dest = dir.path().join("empty");

        a.send_reader(&b""[..], 0).await.unwrap();
        assert_eq!(b.receive_file(&dest).await.unwrap(), 0);
        assert_eq!(std::fs::read(&dest).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_receive_replaces_existing_and_removes_temp() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("doc.txt");
        std::fs::write(&dest, b"old").unwrap();

        let (mut a, mut b) = pair();
        a.send_reader(&b"new content"[..], 11).await.unwrap();
        b.receive_file(&dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new content");
        assert!(!storage::temp_sibling(&dest).exists());
    }

    #[tokio::test]
    async fn test_interrupted_receive_restores_previous() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("doc.txt");
        std::fs::write(&dest, b"previous").unwrap();

        let (mut a, b) = pair();
        let mut b = b.with_read_timeout(Duration::from_millis(100));
        a.write_raw(&100u64.to_be_bytes()).await.unwrap();
        a.write_raw(b"only part").await.unwrap();
        drop(a);

        assert!(b.receive_file(&dest).await.is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert!(!storage::temp_sibling(&dest).exists());
    }

    #[tokio::test]
    async fn test_unwritable_destination_drains_payload() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing-dir").join("file.txt");

        let (mut a, mut b) = pair();
        a.send_reader(&b"payload"[..], 7).await.unwrap();
        a.send_packet(&Packet::reply(Command::Close)).await.unwrap();

        let err = b.receive_file(&dest).await.unwrap_err();
        assert_matches!(err, SyncError::Filesystem { .. });
        // Stream is still in sync.
        assert_eq!(b.receive_packet().await.unwrap().command, Command::Close);
    }

    #[tokio::test]
    async fn test_discard_file() {
        let (mut a, mut b) = session_pair(4);
        a.send_reader(&b"throw me away"[..], 13).await.unwrap();
        a.send_packet(&Packet::reply(Command::Success)).await.unwrap();

        assert_eq!(b.discard_file().await.unwrap(), 13);
        assert_eq!(b.receive_packet().await.unwrap().command, Command::Success);
    }

    #[tokio::test]
    async fn test_file_list_exchange() {
        for (mut a, mut b) in [pair(), rolling_pair(), session_pair(64)] {
            let entries = vec!["root".to_string(), "root/a.txt".to_string()];
            a.send_file_list(&entries).await.unwrap();
            let received = b.receive_file_list().await.unwrap();
            assert_eq!(received.len(), 2);
            assert_eq!(received[0], "root");
        }
    }

    #[tokio::test]
    async fn test_file_list_truncated_stream_errors() {
        let (mut a, mut b) = pair();
        a.write_raw(b"partial\r").await.unwrap();
        drop(a);
        assert!(b.receive_file_list().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_input() {
        let (mut a, mut b) = pair();
        a.write_raw(b"garbage bytes").await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(b.clear_input(), 13);
        assert_eq!(b.clear_input(), 0);

        a.send_packet(&Packet::reply(Command::Failed)).await.unwrap();
        assert_eq!(b.receive_packet().await.unwrap().command, Command::Failed);
    }

    #[tokio::test]
    async fn test_force_send_gives_up_silently() {
        let (mut a, b) = pair();
        drop(b);
        a.force_send_packet(&Packet::reply(Command::Close)).await;
    }
}
