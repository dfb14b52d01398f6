//! Application Configuration Module
//!
//! Typed view of the JSON configuration document consumed once at process
//! start. Configuration errors here are the only fatal startup errors.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-server IRC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IRC nickname
    #[serde(default = "default_nick")]
    pub nick: String,
    /// Append a random 3-digit suffix to the nickname
    #[serde(default)]
    pub random_nick: bool,
    /// NickServ IDENTIFY password
    #[serde(default)]
    pub nickserv_password: Option<String>,
    /// Use TLS for the IRC connection
    #[serde(default)]
    pub use_tls: bool,
    /// Verify the server certificate when TLS is enabled
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// IRC server port (default: 6667, or 6697 with TLS)
    #[serde(default)]
    pub port: Option<u16>,
    /// Channels to join right after registration
    #[serde(default)]
    pub channels: Vec<String>,
    /// Channel -> companion channels that are joined together with it
    #[serde(default)]
    pub also_join: HashMap<String, Vec<String>>,
    /// Channels for which outbound "xdcc send" is rewritten to "xdcc ssend"
    #[serde(default)]
    pub rewrite_to_ssend: HashSet<String>,
}

impl ServerConfig {
    /// Effective port for this server
    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.use_tls { 6697 } else { 6667 })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            random_nick: false,
            nickserv_password: None,
            use_tls: false,
            verify_ssl: true,
            port: None,
            channels: Vec::new(),
            also_join: HashMap::new(),
            rewrite_to_ssend: HashSet::new(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server address -> per-server config; required
    pub servers: HashMap<String, ServerConfig>,
    /// Fallback used when a requested server is not listed in `servers`
    #[serde(default)]
    pub default_server_config: Option<ServerConfig>,
    /// Download directory
    #[serde(default = "default_download_path")]
    pub default_download_path: String,
    /// Allowed MIME types for received files; empty disables enforcement
    #[serde(default)]
    pub allowed_mimetypes: Vec<String>,
    /// Maximum accepted file size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Disconnect idle servers after this many seconds (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub server_idle_timeout: u64,
    /// Part idle channels after this many seconds (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub channel_idle_timeout: u64,
    /// Seconds to wait for a DCC ACCEPT reply to our RESUME
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u64,
    /// Seconds to keep finished transfers in the history
    #[serde(default = "default_transfer_list_timeout")]
    pub transfer_list_timeout: u64,
    /// Suffix appended to files while they are being received (e.g. ".part")
    #[serde(default)]
    pub incomplete_suffix: Option<String>,
    /// Accept DCC offers from private/loopback peer addresses
    #[serde(default)]
    pub allow_private_ips: bool,
    /// Nicknames whose "xdcc send" requests are always rewritten to ssend
    #[serde(default)]
    pub ssend_map: HashSet<String>,
    /// HTTP bind address
    #[serde(default = "default_listen")]
    pub listen: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_nick() -> String {
    "xdccd".to_string()
}
fn default_download_path() -> String {
    "./downloads".to_string()
}
fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_resume_timeout() -> u64 {
    30
}
fn default_transfer_list_timeout() -> u64 {
    86400
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    /// Load the configuration from a JSON file.
    ///
    /// Unlike most error paths in this crate this one is fatal: a missing or
    /// unparseable config file aborts startup.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path, e))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path, e))?;
        tracing::info!(
            "Loaded config from {} ({} servers configured)",
            path,
            config.servers.len()
        );
        Ok(config)
    }

    /// Resolve the config for a server, falling back to `default_server_config`.
    pub fn resolve_server(&self, server: &str) -> Option<ServerConfig> {
        self.servers
            .get(server)
            .or(self.default_server_config.as_ref())
            .cloned()
    }
}
