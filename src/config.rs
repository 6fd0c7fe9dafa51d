//! # Configuration Management
//!
//! TOML configuration for both sides of a backup:
//!
//! - `client.toml` holds the host to reach, the retry settings, the list of
//!   targets and the backup roots with their policies
//! - `host.toml` holds the listening port, the storage root and the
//!   credentials clients must present
//!
//! Files live in a platform-appropriate directory (e.g. `~/.config/backsync/`
//! on Linux). Set `BACKSYNC_CONFIG_DIR` to use another one.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{DEFAULT_CHUNK_SIZE, DEFAULT_READ_TIMEOUT, MAX_CHUNK_SIZE};
use crate::crypto::{HostKey, HostPublicKey};
use crate::handshake::{ClientAuth, CredentialTable, HostAuth};
use crate::host::{HostContext, DEFAULT_BIND_RETRY, DEFAULT_IDLE_TIMEOUT};
use crate::network::NetworkOptions;
use crate::retry::RetryPolicy;
use crate::roots::{BackupRoot, SyncPolicy};
use crate::status::StatusSender;
use crate::target::{BackupTarget, TargetContext, TargetEntry, TargetRegistry};

pub const CONFIG_DIR_ENV: &str = "BACKSYNC_CONFIG_DIR";
pub const CLIENT_CONFIG_FILE: &str = "client.toml";
pub const HOST_CONFIG_FILE: &str = "host.toml";
pub const HOST_KEY_FILE: &str = "host.key";
pub const DEFAULT_PORT: u16 = 41337;

/// Directory holding every configuration file.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("backsync");
    Ok(config_dir)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Key exchange against the host's public key, per-user credentials.
    #[default]
    Secure,
    /// Shared password, optional rolling cipher.
    Legacy,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// How the client reaches and authenticates to the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SecurityMode,
    /// Hex X25519 public key, required in secure mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_key: Option<String>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl NetworkSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_auth(&self) -> Result<ClientAuth> {
        match self.security {
            SecurityMode::Secure => {
                let key = self
                    .host_public_key
                    .as_deref()
                    .context("Secure mode needs 'host_public_key' in [network]")?;
                let host_key = HostPublicKey::from_hex(key).context("Invalid 'host_public_key'")?;
                let username = self
                    .username
                    .clone()
                    .context("Secure mode needs 'username' in [network]")?;
                Ok(ClientAuth::Secure {
                    host_key,
                    username,
                    password: self.password.clone(),
                })
            }
            SecurityMode::Legacy => {
                if self.password.is_empty() {
                    bail!("Legacy mode needs a non-empty 'password' in [network]");
                }
                Ok(ClientAuth::Legacy {
                    password: self.password.clone(),
                    cipher_key: self.cipher_key.clone(),
                })
            }
        }
    }

    pub fn options(&self) -> Result<NetworkOptions> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk_size must be between 1 and {} bytes", MAX_CHUNK_SIZE);
        }
        let mut options = NetworkOptions::new(self.address(), self.client_auth()?);
        options.read_timeout = Duration::from_secs(self.read_timeout_secs.max(1));
        options.chunk_size = self.chunk_size;
        Ok(options)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_secs: policy.base_delay.as_secs(),
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
        }
    }
}

/// Client-side configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
    #[serde(default)]
    pub roots: Vec<BackupRoot>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl ClientConfig {
    /// Writes an empty configuration unless one already exists.
    pub async fn init() -> Result<Self> {
        let config_file = config_dir()?.join(CLIENT_CONFIG_FILE);
        if config_file.exists() {
            bail!("Configuration already exists at {}", config_file.display());
        }

        let config = Self {
            config_file_path: config_file,
            ..Self::default()
        };
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = config_dir()?.join(CLIENT_CONFIG_FILE);
        if !config_file.exists() {
            bail!("backsync not initialized. Run 'backsync init' first.");
        }
        Self::load_from(&config_file).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: ClientConfig =
            toml::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.config_file_path = path.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn roots(&self) -> &[BackupRoot] {
        &self.roots
    }

    pub fn find_root(&self, path: &Path) -> Option<&BackupRoot> {
        let path = normalize(path);
        self.roots.iter().find(|root| root.path == path)
    }

    /// Adds a file or directory root. Paths and remote names must be unique.
    pub fn add_root(&mut self, path: &Path, policy: SyncPolicy, remote_name: Option<String>) -> Result<&BackupRoot> {
        if !path.exists() {
            bail!("Path does not exist: {}", path.display());
        }
        let root = BackupRoot::new(path, policy, remote_name)?;

        if self.roots.iter().any(|r| r.path == root.path) {
            bail!("{} is already a backup root", root.path.display());
        }
        if self.roots.iter().any(|r| r.remote_name() == root.remote_name()) {
            bail!(
                "Another root already uses the remote name '{}'; pass --remote-name",
                root.remote_name()
            );
        }

        self.roots.push(root);
        Ok(&self.roots[self.roots.len() - 1])
    }

    /// Changes the policy and/or remote name of an existing root.
    pub fn edit_root(
        &mut self,
        path: &Path,
        policy: Option<SyncPolicy>,
        remote_name: Option<String>,
    ) -> Result<&BackupRoot> {
        let path = normalize(path);
        let index = self
            .roots
            .iter()
            .position(|r| r.path == path)
            .with_context(|| format!("{} is not a backup root", path.display()))?;

        let current = &self.roots[index];
        let edited = BackupRoot::new(
            &current.path,
            policy.unwrap_or(current.policy),
            remote_name.or_else(|| current.remote_name.clone()),
        )?;

        let clash = self
            .roots
            .iter()
            .enumerate()
            .any(|(i, r)| i != index && r.remote_name() == edited.remote_name());
        if clash {
            bail!("Another root already uses the remote name '{}'", edited.remote_name());
        }

        self.roots[index] = edited;
        Ok(&self.roots[index])
    }

    pub fn remove_root(&mut self, path: &Path) -> Result<BackupRoot> {
        let path = normalize(path);
        let index = self
            .roots
            .iter()
            .position(|r| r.path == path)
            .with_context(|| format!("{} is not a backup root", path.display()))?;
        Ok(self.roots.remove(index))
    }

    /// Configured targets, or a single network target when only `[network]` is set.
    pub fn target_entries(&self) -> Vec<TargetEntry> {
        if self.targets.is_empty() && self.network.is_some() {
            vec![TargetEntry::network("host")]
        } else {
            self.targets.clone()
        }
    }

    pub fn target_context(&self, status: StatusSender) -> Result<TargetContext> {
        let network = match &self.network {
            Some(settings) => Some(settings.options()?),
            None => None,
        };
        Ok(TargetContext {
            network,
            retry: self.retry.into(),
            status,
        })
    }

    pub fn build_targets(&self, registry: &TargetRegistry, status: StatusSender) -> Result<Vec<Box<dyn BackupTarget>>> {
        let entries = self.target_entries();
        if entries.is_empty() {
            bail!("No targets configured. Add [network] or [[targets]] to {}", self.config_file_path.display());
        }
        let ctx = self.target_context(status)?;
        entries
            .iter()
            .map(|entry| registry.build(entry, &ctx).map_err(anyhow::Error::from))
            .collect()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_bind_retry() -> u64 {
    DEFAULT_BIND_RETRY.as_secs()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// Host-side configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub storage_root: PathBuf,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_key: Option<String>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_bind_retry")]
    pub bind_retry_secs: u64,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl HostConfig {
    pub fn new(storage_root: PathBuf) -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            bind_address: default_bind_address(),
            storage_root,
            security: SecurityMode::Secure,
            key_file: None,
            legacy_password: None,
            cipher_key: None,
            users: Vec::new(),
            read_timeout_secs: default_read_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            bind_retry_secs: default_bind_retry(),
            config_file_path: PathBuf::new(),
        }
    }

    /// Loads `path`, or `host.toml` in the config directory.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => config_dir()?.join(HOST_CONFIG_FILE),
        };
        let content = tokio::fs::read_to_string(&config_file)
            .await
            .with_context(|| format!("Failed to read host configuration {}", config_file.display()))?;
        let mut config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid host configuration in {}", config_file.display()))?;
        config.config_file_path = config_file;
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.listen_port)
    }

    /// Relative key paths are taken relative to the configuration file.
    pub fn key_path(&self) -> Option<PathBuf> {
        let key = self.key_file.as_ref()?;
        if key.is_absolute() {
            return Some(key.clone());
        }
        let base = self.config_file_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(key))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.storage_root.is_dir() {
            bail!("Storage root {} is not a directory", self.storage_root.display());
        }
        match self.security {
            SecurityMode::Secure => {
                if self.key_file.is_none() {
                    bail!("Secure mode needs 'key_file'. Generate one with 'backsync keygen <file>'");
                }
                if self.users.is_empty() {
                    bail!("Secure mode needs at least one [[users]] entry");
                }
            }
            SecurityMode::Legacy => {
                if self.legacy_password.as_deref().map_or(true, str::is_empty) {
                    bail!("Legacy mode needs a non-empty 'legacy_password'");
                }
            }
        }
        Ok(())
    }

    pub fn host_auth(&self) -> Result<HostAuth> {
        self.validate()?;
        match self.security {
            SecurityMode::Secure => {
                let path = self.key_path().context("Secure mode needs 'key_file'")?;
                let key = HostKey::load(&path)?;
                let users: CredentialTable = self
                    .users
                    .iter()
                    .map(|user| (user.username.clone(), user.password.clone()))
                    .collect();
                Ok(HostAuth::Secure { key, users })
            }
            SecurityMode::Legacy => Ok(HostAuth::Legacy {
                password: self.legacy_password.clone().unwrap_or_default(),
                cipher_key: self.cipher_key.clone(),
            }),
        }
    }

    pub fn context(&self, status: StatusSender) -> Result<HostContext> {
        let mut ctx = HostContext::new(self.storage_root.clone(), self.host_auth()?);
        ctx.read_timeout = Duration::from_secs(self.read_timeout_secs.max(1));
        ctx.idle_timeout = Duration::from_secs(self.idle_timeout_secs.max(1));
        ctx.status = status;
        Ok(ctx)
    }

    pub fn bind_retry(&self) -> Duration {
        Duration::from_secs(self.bind_retry_secs)
    }
}
