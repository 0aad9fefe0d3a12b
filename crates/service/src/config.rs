use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PASSWORD_ENV: &str = "RMM_KEY_PASSWORD";

/// What a node does once it is running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Holds the registry and relays operators to agents
    #[default]
    Server,
    /// A managed device
    Agent,
    /// An operator's workstation
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "server",
            Role::Agent => "agent",
            Role::Client => "client",
        })
    }
}

/// Where agents and clients find their server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// iroh node id of the server
    pub node_id: String,
    /// PEM file with the server's certificate, relative to the data dir
    /// unless absolute
    pub certificate: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: Role,
    /// Certificate name this node enrolls or sets up under
    pub name: String,
    /// Address for the iroh endpoint; ephemeral when unset
    pub listen_addr: Option<SocketAddr>,
    /// Where the node keeps its state; filled in when the state is loaded
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub log_level: String,
    /// Directory for daily log files; stdout only when unset
    pub log_dir: Option<PathBuf>,
    pub expiration_window_secs: u64,
    pub enrollment_lifetime_secs: u64,
    /// Let operators open TCP tunnels through this agent
    pub tunnels: bool,
    pub upstream: Option<UpstreamConfig>,
    /// Environment variable holding the private key password
    pub key_password_env: String,
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rmm")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            name: "rmm".to_string(),
            listen_addr: None,
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
            expiration_window_secs: 30,
            enrollment_lifetime_secs: 600,
            tunnels: false,
            upstream: None,
            key_password_env: DEFAULT_PASSWORD_ENV.to_string(),
        }
    }
}

impl NodeConfig {
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        tracing::Level::from_str(&self.log_level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_window_secs)
    }

    pub fn enrollment_lifetime(&self) -> Duration {
        Duration::from_secs(self.enrollment_lifetime_secs)
    }

    pub fn upstream(&self) -> Result<&UpstreamConfig, ConfigError> {
        self.upstream.as_ref().ok_or(ConfigError::MissingUpstream)
    }

    /// The private key password, read from the configured variable
    pub fn key_password(&self) -> Result<String, ConfigError> {
        std::env::var(&self.key_password_env)
            .map_err(|_| ConfigError::MissingPassword(self.key_password_env.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("no upstream server configured")]
    MissingUpstream,
    #[error("key password not set; export {0}")]
    MissingPassword(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: NodeConfig = toml::from_str("role = \"agent\"\nname = \"kiosk\"").unwrap();
        assert_eq!(config.role, Role::Agent);
        assert_eq!(config.name, "kiosk");
        assert_eq!(config.expiration(), Duration::from_secs(30));
        assert_eq!(config.enrollment_lifetime(), Duration::from_secs(600));
        assert_eq!(config.key_password_env, DEFAULT_PASSWORD_ENV);
        assert!(config.upstream.is_none());
        assert!(!config.tunnels);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NodeConfig::new(Role::Client, "laptop");
        config.upstream = Some(UpstreamConfig {
            node_id: "abc".into(),
            certificate: "upstream.pem".into(),
        });
        config.save(&path).unwrap();

        let mut loaded = NodeConfig::load(&path).unwrap();
        loaded.data_dir = config.data_dir.clone();
        assert_eq!(loaded, config);
    }

    #[test]
    fn rejects_unknown_log_levels() {
        let config = NodeConfig {
            log_level: "chatty".into(),
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.log_level(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
        assert_eq!(
            NodeConfig::default().log_level().unwrap(),
            tracing::Level::INFO
        );
    }

    #[test]
    fn missing_password_names_the_variable() {
        let config = NodeConfig {
            key_password_env: "RMM_TEST_UNSET_PASSWORD_VAR".into(),
            ..NodeConfig::default()
        };
        match config.key_password() {
            Err(ConfigError::MissingPassword(var)) => {
                assert_eq!(var, "RMM_TEST_UNSET_PASSWORD_VAR")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
