//! # Wire Codec
//!
//! Fixed-layout request/response packets and the flat file-list stream.
//!
//! ```text
//! packet:    [1B command][8B BE timestamp (epoch ms)][1B file status][UTF-8 path...]
//! file list: ( [UTF-8 path] 0x0D )* 0xFF
//! ```
//!
//! The path has no length field; it consumes the rest of the frame. Path
//! separators are rewritten to the local platform's separator on decode so
//! hosts and clients with different conventions interoperate.

use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Fixed header size before the path bytes.
pub const HEADER_LEN: usize = 10;

/// Separator between file-list entries.
pub const LIST_SEPARATOR: u8 = 0x0D;

/// End of a file list. Never valid inside UTF-8.
pub const LIST_TERMINATOR: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),

    #[error("unknown command byte 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("path is not valid UTF-8")]
    InvalidPath,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("file chunk overruns declared size")]
    ChunkOverrun,

    #[error("file list is missing its terminator")]
    UnterminatedList,
}

/// Request and response commands. Byte values are fixed for interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Close = 0x04,
    /// "Receive this file from me."
    ReceiveFile = 0x52,
    SendFileList = 0x4C,
    /// "Send me this file."
    SendFile = 0x53,
    CreateDirectory = 0x44,
    GetStatus = 0x3F,
    Success = 0x55,
    Failed = 0x21,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Close,
        Command::ReceiveFile,
        Command::SendFileList,
        Command::SendFile,
        Command::CreateDirectory,
        Command::GetStatus,
        Command::Success,
        Command::Failed,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_byte() == byte)
            .ok_or(DecodeError::UnknownCommand(byte))
    }
}

/// State of the responder's file relative to the requester's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileStatus {
    NotFound = b'M',
    SameVersion = b'S',
    /// The responder's copy is older.
    OldVersion = b'O',
    /// The responder's copy is newer.
    NewVersion = b'N',
    Directory = b'D',
    Unknown = b'U',
}

impl FileStatus {
    pub const ALL: [FileStatus; 6] = [
        FileStatus::NotFound,
        FileStatus::SameVersion,
        FileStatus::OldVersion,
        FileStatus::NewVersion,
        FileStatus::Directory,
        FileStatus::Unknown,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Unrecognized bytes are not fatal; they read as `Unknown`.
    pub fn from_byte(byte: u8) -> Self {
        FileStatus::ALL
            .into_iter()
            .find(|s| s.as_byte() == byte)
            .unwrap_or(FileStatus::Unknown)
    }

    /// Status of the responder's file given both modification times.
    ///
    /// Purely a timestamp comparison: two different files sharing a
    /// millisecond are reported as `SameVersion`.
    pub fn compare(responder_mtime: i64, requester_mtime: i64) -> Self {
        match responder_mtime.cmp(&requester_mtime) {
            std::cmp::Ordering::Greater => FileStatus::NewVersion,
            std::cmp::Ordering::Less => FileStatus::OldVersion,
            std::cmp::Ordering::Equal => FileStatus::SameVersion,
        }
    }
}

/// A single request/response unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub status: FileStatus,
    pub timestamp: i64,
    pub path: String,
}

impl Packet {
    pub fn new(command: Command, path: impl Into<String>) -> Self {
        Self {
            command,
            status: FileStatus::Unknown,
            timestamp: 0,
            path: path.into(),
        }
    }

    /// A bare response such as `SUCCESS` or `FAILED`.
    pub fn reply(command: Command) -> Self {
        Self::new(command, String::new())
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }

    pub fn with_status(mut self, status: FileStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.path.len());
        bytes.push(self.command.as_byte());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.push(self.status.as_byte());
        bytes.extend_from_slice(self.path.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }

        let command = Command::try_from(bytes[0])?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[1..9]);
        let status = FileStatus::from_byte(bytes[9]);
        let path = std::str::from_utf8(&bytes[HEADER_LEN..]).map_err(|_| DecodeError::InvalidPath)?;

        Ok(Self {
            command,
            status,
            timestamp: i64::from_be_bytes(ts),
            path: to_local_separators(path),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} {} '{}'", self.command, self.status, self.timestamp, self.path)
    }
}

/// Rewrites both `/` and `\` to the platform separator.
pub fn to_local_separators(path: &str) -> String {
    let sep = std::path::MAIN_SEPARATOR;
    path.chars()
        .map(|c| if c == '/' || c == '\\' { sep } else { c })
        .collect()
}

/// Encodes relative paths as a `0x0D`-separated, `0xFF`-terminated stream.
///
/// Entries containing the separator byte cannot be represented and are
/// skipped with a warning.
pub fn encode_file_list<I, S>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.as_ref();
        if entry.as_bytes().contains(&LIST_SEPARATOR) {
            warn!("Skipping list entry containing a carriage return: {:?}", entry);
            continue;
        }
        out.extend_from_slice(entry.as_bytes());
        out.push(LIST_SEPARATOR);
    }
    out.push(LIST_TERMINATOR);
    out
}

/// Decodes a complete file-list stream, terminator included.
pub fn decode_file_list(bytes: &[u8]) -> Result<Vec<String>, DecodeError> {
    let end = bytes
        .iter()
        .position(|&b| b == LIST_TERMINATOR)
        .ok_or(DecodeError::UnterminatedList)?;

    let mut entries = Vec::new();
    let mut body = &bytes[..end];
    while let Some(pos) = body.iter().position(|&b| b == LIST_SEPARATOR) {
        let entry = std::str::from_utf8(&body[..pos]).map_err(|_| DecodeError::InvalidPath)?;
        entries.push(to_local_separators(entry));
        body = &body[pos + 1..];
    }

    // Trailing bytes without a separator are a partial entry; drop them.
    if !body.is_empty() {
        warn!("Discarding {} bytes of unterminated list entry", body.len());
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn local(path: &str) -> String {
        to_local_separators(path)
    }

    #[test]
    fn test_command_bytes_are_fixed() {
        assert_eq!(Command::Close.as_byte(), 0x04);
        assert_eq!(Command::ReceiveFile.as_byte(), 0x52);
        assert_eq!(Command::SendFileList.as_byte(), 0x4C);
        assert_eq!(Command::SendFile.as_byte(), 0x53);
        assert_eq!(Command::CreateDirectory.as_byte(), 0x44);
        assert_eq!(Command::GetStatus.as_byte(), 0x3F);
        assert_eq!(Command::Success.as_byte(), 0x55);
        assert_eq!(Command::Failed.as_byte(), 0x21);
    }

    #[test]
    fn test_encode_layout() {
        let packet = Packet::new(Command::GetStatus, "docs")
            .with_timestamp(0x0102_0304_0506_0708)
            .with_status(FileStatus::NewVersion);
        let bytes = packet.encode();

        assert_eq!(bytes[0], 0x3F);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[9], b'N');
        assert_eq!(&bytes[10..], b"docs");
    }

    #[test]
    fn test_roundtrip_every_command_and_status() {
        let paths = ["", "plain.txt", &local("dir/sub/file.bin")];
        for command in Command::ALL {
            for status in FileStatus::ALL {
                for path in paths {
                    let packet = Packet::new(command, path)
                        .with_status(status)
                        .with_timestamp(1_700_000_000_123);
                    let bytes = packet.encode();
                    let decoded = Packet::decode(&bytes).unwrap();
                    assert_eq!(decoded, packet);
                    assert_eq!(decoded.encode(), bytes);
                }
            }
        }
    }

    #[test]
    fn test_negative_timestamp_roundtrip() {
        let packet = Packet::new(Command::ReceiveFile, "old").with_timestamp(-1);
        assert_eq!(Packet::decode(&packet.encode()).unwrap().timestamp, -1);
    }

    #[test]
    fn test_decode_normalizes_both_separator_conventions() {
        let mut bytes = Packet::new(Command::SendFile, "").encode();
        bytes.extend_from_slice(b"a\\b/c.txt");
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.path, local("a/b/c.txt"));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert_matches!(Packet::decode(&[0x04; 9]), Err(DecodeError::TooShort(9)));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut bytes = Packet::reply(Command::Success).encode();
        bytes[0] = 0x7E;
        assert_matches!(Packet::decode(&bytes), Err(DecodeError::UnknownCommand(0x7E)));
    }

    #[test]
    fn test_unknown_status_is_not_fatal() {
        let mut bytes = Packet::reply(Command::Success).encode();
        bytes[9] = 0x00;
        assert_eq!(Packet::decode(&bytes).unwrap().status, FileStatus::Unknown);
    }

    #[test]
    fn test_invalid_utf8_path() {
        let mut bytes = Packet::reply(Command::SendFile).encode();
        bytes.extend_from_slice(&[0xC3, 0x28]);
        assert_matches!(Packet::decode(&bytes), Err(DecodeError::InvalidPath));
    }

    #[test]
    fn test_status_comparison() {
        assert_eq!(FileStatus::compare(20, 10), FileStatus::NewVersion);
        assert_eq!(FileStatus::compare(10, 20), FileStatus::OldVersion);
        assert_eq!(FileStatus::compare(10, 10), FileStatus::SameVersion);
    }

    #[test]
    fn test_file_list_encoding() {
        let bytes = encode_file_list(["a", "b.txt"]);
        assert_eq!(bytes, vec![b'a', 0x0D, b'b', b'.', b't', b'x', b't', 0x0D, 0xFF]);
        assert_eq!(encode_file_list(Vec::<String>::new()), vec![0xFF]);
    }

    #[test]
    fn test_file_list_skips_unrepresentable_entries() {
        let bytes = encode_file_list(["good", "bad\rname"]);
        assert_eq!(decode_file_list(&bytes).unwrap(), vec!["good".to_string()]);
    }

    #[test]
    fn test_file_list_decoding() {
        let entries = vec!["docs".to_string(), local("docs/a.txt"), local("docs/sub/ü.md")];
        let decoded = decode_file_list(&encode_file_list(&entries)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_file_list_missing_terminator() {
        assert_matches!(decode_file_list(b"a\r"), Err(DecodeError::UnterminatedList));
    }
}
