//! # Session Handshake
//!
//! Runs once per connection, before any packet is exchanged.
//!
//! Secure mode:
//!
//! ```text
//! client -> host   [16B IV][4B BE len][wrapped session key]
//!                  (both sides switch to the session cipher)
//! client -> host   [frame: username][frame: password]
//! host   -> client [frame: 0x01]        or the socket is closed
//! ```
//!
//! Legacy mode sends the shared password in the clear as one frame and is
//! answered by a single `1` byte; traffic afterwards goes through the rolling
//! cipher when a cipher key is configured. It exists only to talk to old
//! installations.
//!
//! ```text
//! client -> host   [frame: password]
//! host   -> client 0x01                 or the socket is closed
//! ```
//!
//! A host never tells the client why it was rejected.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::crypto::{
    unwrap_session_key, wrap_session_key, HostKey, HostPublicKey, Role, RollingCipher, SessionCipher, SessionKey,
    Transform, SESSION_IV_LEN,
};
use crate::error::{is_connection_loss, SyncError, SyncResult};

/// Upper bound for the wrapped key length announced by a client.
pub const MAX_WRAPPED_KEY_LEN: usize = 1024;

/// Upper bound for a username or password frame.
pub const MAX_CREDENTIAL_LEN: usize = 4096;

const ACCEPTED: u8 = 1;

#[derive(Clone)]
pub enum ClientAuth {
    Secure {
        host_key: HostPublicKey,
        username: String,
        password: String,
    },
    Legacy {
        password: String,
        cipher_key: Option<String>,
    },
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientAuth::Secure { username, .. } => write!(f, "ClientAuth::Secure({})", username),
            ClientAuth::Legacy { .. } => write!(f, "ClientAuth::Legacy"),
        }
    }
}

#[derive(Clone)]
pub enum HostAuth {
    Secure { key: HostKey, users: CredentialTable },
    Legacy { password: String, cipher_key: Option<String> },
}

/// Username to password-digest table.
#[derive(Clone, Default)]
pub struct CredentialTable {
    digests: HashMap<String, [u8; 32]>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: impl Into<String>, password: &str) {
        self.digests.insert(username.into(), digest(password.as_bytes()));
    }

    /// Unknown user and wrong password are indistinguishable to the caller.
    pub fn verify(&self, username: &str, password: &[u8]) -> bool {
        let presented = digest(password);
        match self.digests.get(username) {
            Some(expected) => constant_time_eq(expected, &presented),
            None => {
                let _ = constant_time_eq(&[0u8; 32], &presented);
                false
            }
        }
    }
}

impl<K: Into<String>, V: AsRef<str>> FromIterator<(K, V)> for CredentialTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = CredentialTable::new();
        for (user, password) in iter {
            table.insert(user, password.as_ref());
        }
        table
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn rolling_transform(cipher_key: Option<&str>) -> SyncResult<Transform> {
    match cipher_key {
        Some(key) if !key.is_empty() => Ok(Transform::Rolling(RollingCipher::new(key.as_bytes().to_vec())?)),
        _ => Ok(Transform::Plain),
    }
}

pub async fn client_handshake<S>(channel: &mut Channel<S>, auth: &ClientAuth) -> SyncResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match auth {
        ClientAuth::Secure {
            host_key,
            username,
            password,
        } => {
            let session = SessionKey::generate();
            let wrapped = wrap_session_key(host_key, &session)?;

            let mut hello = Vec::with_capacity(SESSION_IV_LEN + 4 + wrapped.len());
            hello.extend_from_slice(&session.iv);
            hello.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
            hello.extend_from_slice(&wrapped);
            channel.write_raw(&hello).await?;

            channel.set_transform(Transform::Session(SessionCipher::new(&session, Role::Client)?));
            channel.write_frame(username.as_bytes()).await?;
            channel.write_frame(password.as_bytes()).await?;

            match channel.read_frame(1).await {
                Ok(ack) if ack == [ACCEPTED] => {
                    info!("Authenticated to {} as '{}'", channel.peer(), username);
                    Ok(())
                }
                Ok(_) => Err(SyncError::Handshake("unexpected acknowledgement".into())),
                Err(SyncError::ConnectionClosed) => Err(SyncError::AuthenticationFailed),
                Err(SyncError::Io(ref e)) if is_connection_loss(e) => Err(SyncError::AuthenticationFailed),
                Err(e) => Err(e),
            }
        }
        ClientAuth::Legacy { password, cipher_key } => {
            warn!("Using legacy authentication to {}; traffic is not protected", channel.peer());
            channel.write_frame(password.as_bytes()).await?;

            match channel.read_byte().await {
                Some(ACCEPTED) => {}
                _ => return Err(SyncError::AuthenticationFailed),
            }

            channel.set_transform(rolling_transform(cipher_key.as_deref())?);
            info!("Authenticated to {} (legacy)", channel.peer());
            Ok(())
        }
    }
}

/// Authenticates a connecting client. Returns the accepted username.
///
/// On any error the caller must close the connection without replying.
pub async fn host_handshake<S>(channel: &mut Channel<S>, auth: &HostAuth) -> SyncResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match auth {
        HostAuth::Secure { key, users } => {
            let iv_bytes = channel.read_raw(SESSION_IV_LEN).await?;
            let mut iv = [0u8; SESSION_IV_LEN];
            iv.copy_from_slice(&iv_bytes);

            let len_bytes = channel.read_raw(4).await?;
            let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
            if len > MAX_WRAPPED_KEY_LEN {
                return Err(SyncError::Handshake(format!("wrapped key of {} bytes", len)));
            }

            let wrapped = channel.read_raw(len).await?;
            let session = unwrap_session_key(key, iv, &wrapped)?;
            channel.set_transform(Transform::Session(SessionCipher::new(&session, Role::Host)?));

            let username = channel.read_frame(MAX_CREDENTIAL_LEN).await?;
            let password = channel.read_frame(MAX_CREDENTIAL_LEN).await?;
            let username = String::from_utf8(username).map_err(|_| SyncError::AuthenticationFailed)?;

            if !users.verify(&username, &password) {
                debug!("Rejected credentials from {}", channel.peer());
                return Err(SyncError::AuthenticationFailed);
            }

            channel.write_frame(&[ACCEPTED]).await?;
            Ok(username)
        }
        HostAuth::Legacy { password, cipher_key } => {
            let presented = channel.read_frame(MAX_CREDENTIAL_LEN).await?;
            if !constant_time_eq(&digest(password.as_bytes()), &digest(&presented)) {
                debug!("Rejected legacy password from {}", channel.peer());
                return Err(SyncError::AuthenticationFailed);
            }

            channel.write_raw(&[ACCEPTED]).await?;
            channel.set_transform(rolling_transform(cipher_key.as_deref())?);
            Ok(String::new())
        }
    }
}
