//! # Cryptographic Operations
//!
//! Everything the channel needs to protect traffic after the handshake:
//! - Host static key pair (X25519), persisted as a TOML key file
//! - Session key wrapping: ephemeral-static X25519 agreement, HKDF-SHA256,
//!   ChaCha20-Poly1305 sealing of the client's random session key
//! - [`SessionCipher`]: per-frame ChaCha20-Poly1305 with one key and one
//!   nonce counter per direction
//! - [`RollingCipher`]: the legacy additive byte cipher, kept only for
//!   compatibility with old peers. It provides no real confidentiality.
//! - [`Transform`]: the pluggable layer a channel applies to its traffic
//!
//! Secure mode is not wire-compatible with peers that wrap the session key
//! with RSA and seal traffic with AES-CBC: the key exchange, the frame
//! sealing and the key file format all differ, so such a peer fails the
//! handshake. Only legacy mode interoperates with those installations.

use std::path::Path;

use anyhow::{Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub const SESSION_KEY_LEN: usize = 32;
pub const SESSION_IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Ephemeral public key followed by the sealed session key.
pub const WRAPPED_KEY_LEN: usize = 32 + SESSION_KEY_LEN + TAG_LEN;

const WRAP_INFO: &[u8] = b"backsync-key-wrap-v1";
const CLIENT_TO_HOST: &[u8] = b"backsync-c2h-v1";
const HOST_TO_CLIENT: &[u8] = b"backsync-h2c-v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("failed to wrap session key")]
    WrapFailed,

    #[error("failed to unwrap session key")]
    UnwrapFailed,

    #[error("failed to seal frame")]
    SealFailed,

    #[error("frame failed authentication")]
    OpenFailed,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    #[error("rolling cipher key is empty")]
    EmptyRollingKey,
}

/// The host's long-lived X25519 key pair.
#[derive(Clone)]
pub struct HostKey {
    secret: StaticSecret,
}

#[derive(Serialize, Deserialize)]
struct HostKeyFile {
    secret_key: String,
    public_key: String,
}

impl HostKey {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            secret: StaticSecret::from(seed),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let file: HostKeyFile = toml::from_str(&content)?;

        let bytes = decode_key_hex(&file.secret_key)?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = HostKeyFile {
            secret_key: hex::encode(self.secret.to_bytes()),
            public_key: self.public_key().to_hex(),
        };

        let content = toml::to_string_pretty(&file)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn public_key(&self) -> HostPublicKey {
        HostPublicKey(PublicKey::from(&self.secret))
    }
}

/// The host's public key as the client knows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPublicKey(PublicKey);

impl HostPublicKey {
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = decode_key_hex(s).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(PublicKey::from(bytes)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

fn decode_key_hex(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).context("Key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("Key must be 32 bytes, got {}", v.len()))
}

/// Per-connection key material generated by the client. Never persisted.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub struct SessionKey {
    pub key: [u8; SESSION_KEY_LEN],
    pub iv: [u8; SESSION_IV_LEN],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut iv = [0u8; SESSION_IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }
}

/// Wraps the session key for the holder of `host`'s secret.
///
/// The IV travels in the clear but is bound as associated data.
pub fn wrap_session_key(host: &HostPublicKey, session: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let ephemeral = StaticSecret::from(seed);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&host.0);
    let kek = derive_wrap_key(shared.as_bytes(), ephemeral_public.as_bytes(), host.0.as_bytes())?;

    let sealed = ChaCha20Poly1305::new(Key::from_slice(&kek))
        .encrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: &session.key,
                aad: &session.iv,
            },
        )
        .map_err(|_| CryptoError::WrapFailed)?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

pub fn unwrap_session_key(
    host: &HostKey,
    iv: [u8; SESSION_IV_LEN],
    wrapped: &[u8],
) -> Result<SessionKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::UnwrapFailed);
    }

    let mut eph = [0u8; 32];
    eph.copy_from_slice(&wrapped[..32]);
    let ephemeral_public = PublicKey::from(eph);

    let shared = host.secret.diffie_hellman(&ephemeral_public);
    let own_public = PublicKey::from(&host.secret);
    let kek = derive_wrap_key(shared.as_bytes(), &eph, own_public.as_bytes())?;

    let key = ChaCha20Poly1305::new(Key::from_slice(&kek))
        .decrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: &wrapped[32..],
                aad: &iv,
            },
        )
        .map_err(|_| CryptoError::UnwrapFailed)?;

    let key: [u8; SESSION_KEY_LEN] = key.try_into().map_err(|_| CryptoError::UnwrapFailed)?;
    Ok(SessionKey { key, iv })
}

fn derive_wrap_key(shared: &[u8], ephemeral: &[u8], host: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 64);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(host);

    let mut out = [0u8; 32];
    Hkdf::<Sha256>::new(None, shared)
        .expand(&info, &mut out)
        .map_err(|_| CryptoError::WrapFailed)?;
    Ok(out)
}

/// Which end of the connection a cipher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Host,
}

/// Authenticated per-frame cipher negotiated by the handshake.
///
/// Nonce layout: `iv[0..4] || counter (u64 BE)`, one counter per direction,
/// so frames must be opened in the order they were sealed.
pub struct SessionCipher {
    outgoing: ChaCha20Poly1305,
    incoming: ChaCha20Poly1305,
    prefix: [u8; 4],
    sent: u64,
    received: u64,
}

impl SessionCipher {
    pub fn new(session: &SessionKey, role: Role) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&session.iv), &session.key);
        let mut c2h = [0u8; 32];
        let mut h2c = [0u8; 32];
        hk.expand(CLIENT_TO_HOST, &mut c2h)
            .map_err(|_| CryptoError::InvalidKey("key derivation failed".into()))?;
        hk.expand(HOST_TO_CLIENT, &mut h2c)
            .map_err(|_| CryptoError::InvalidKey("key derivation failed".into()))?;

        let (out_key, in_key) = match role {
            Role::Client => (c2h, h2c),
            Role::Host => (h2c, c2h),
        };

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&session.iv[..4]);

        Ok(Self {
            outgoing: ChaCha20Poly1305::new(Key::from_slice(&out_key)),
            incoming: ChaCha20Poly1305::new(Key::from_slice(&in_key)),
            prefix,
            sent: 0,
            received: 0,
        })
    }

    fn nonce(prefix: [u8; 4], counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&prefix);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::nonce(self.prefix, self.sent);
        self.sent = self.sent.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
        self.outgoing
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::SealFailed)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::OpenFailed);
        }
        let nonce = Self::nonce(self.prefix, self.received);
        self.received = self.received.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
        self.incoming
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| CryptoError::OpenFailed)
    }
}

/// Legacy additive stream cipher: `out = in + key[pos % len]` (wrapping) on
/// send, subtraction on receive. Each direction keeps its own position.
#[derive(Debug, Clone)]
pub struct RollingCipher {
    key: Vec<u8>,
    send_pos: usize,
    recv_pos: usize,
}

impl RollingCipher {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CryptoError::EmptyRollingKey);
        }
        Ok(Self {
            key,
            send_pos: 0,
            recv_pos: 0,
        })
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = b.wrapping_add(self.key[self.send_pos]);
            self.send_pos = (self.send_pos + 1) % self.key.len();
        }
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = b.wrapping_sub(self.key[self.recv_pos]);
            self.recv_pos = (self.recv_pos + 1) % self.key.len();
        }
    }
}

/// Traffic transform applied by a channel once the handshake is done.
pub enum Transform {
    Plain,
    Rolling(RollingCipher),
    Session(SessionCipher),
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Plain => "plain",
            Transform::Rolling(_) => "rolling",
            Transform::Session(_) => "session",
        }
    }

    /// Framed transforms change payload length, so files travel in
    /// length-prefixed chunks instead of a raw byte stream.
    pub fn is_framed(&self) -> bool {
        matches!(self, Transform::Session(_))
    }

    /// Byte-stream encryption for unframed transforms.
    pub fn encrypt_stream(&mut self, buf: &mut [u8]) {
        if let Transform::Rolling(cipher) = self {
            cipher.encrypt(buf);
        }
    }

    pub fn decrypt_stream(&mut self, buf: &mut [u8]) {
        if let Transform::Rolling(cipher) = self {
            cipher.decrypt(buf);
        }
    }

    /// Seals a frame payload. Unframed transforms return it unchanged.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Transform::Session(cipher) => cipher.seal(payload),
            _ => Ok(payload.to_vec()),
        }
    }

    pub fn open(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Transform::Session(cipher) => cipher.open(payload),
            _ => Ok(payload.to_vec()),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transform::{}", self.name())
    }
}
