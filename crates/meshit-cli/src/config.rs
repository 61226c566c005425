//! Configuration system for the meshit CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// meshit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity configuration.
    pub node: NodeConfig,
    /// Network (dev-transport) configuration.
    pub network: NetworkConfig,
    /// Channels to auto-join on startup.
    pub channels: ChannelsConfig,
    /// Store-and-forward queue configuration.
    pub store_and_forward: StoreAndForwardConfig,
    /// File-transfer configuration.
    pub file_transfer: FileTransferConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Nickname advertised in channel membership and verification URIs.
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Path to the persisted `identity.json`.
    #[serde(default = "default_identity_path")]
    pub identity_file: PathBuf,
}

/// Network configuration for the TCP development transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peer addresses to dial on startup.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

/// Channels to join automatically on startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    /// Channel names (normalized on join; need not include the `#`).
    #[serde(default)]
    pub auto_join: Vec<String>,
}

/// Store-and-forward queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAndForwardConfig {
    /// Directory holding per-peer `.jsonl` queue files.
    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,
}

/// File-transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferConfig {
    /// Directory incoming files are written to.
    #[serde(default = "default_received_dir")]
    pub received_dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `"info"`, `"debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_nickname() -> String {
    "anonymous".to_string()
}

fn default_identity_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("meshit/identity.json")
}

fn default_listen_addr() -> String {
    "127.0.0.1:41000".to_string()
}

fn default_pending_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("meshit/pending")
}

fn default_received_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("meshit/received")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            identity_file: default_identity_path(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for StoreAndForwardConfig {
    fn default() -> Self {
        Self {
            pending_dir: default_pending_dir(),
        }
    }
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            received_dir: default_received_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// The default config file path (`$XDG_CONFIG_HOME/meshit/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("meshit/config.toml")
    }

    /// Load from the default path, or create and persist a default
    /// configuration if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse `network.listen_addr` as a [`SocketAddr`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any field fails validation.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for peer in &self.network.bootstrap_peers {
            self.validate_host_port(peer, "Bootstrap peer")?;
        }

        if self.node.nickname.trim().is_empty() {
            anyhow::bail!("Node nickname must not be empty");
        }

        Ok(())
    }

    fn validate_host_port(&self, addr: &str, name: &str) -> anyhow::Result<()> {
        let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
        if parts.len() != 2 {
            anyhow::bail!("{} '{}' missing port (expected format: host:port)", name, addr);
        }

        let port_str = parts[0];
        let host = parts[1];

        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;
        if port == 0 {
            anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
        }

        if host.is_empty() {
            anyhow::bail!("{} '{}' has empty hostname", name, addr);
        }
        if host.contains("..") || host.contains('/') || host.contains('\\') {
            anyhow::bail!("{} '{}' contains invalid characters", name, addr);
        }

        Ok(())
    }
}
