use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;

use common::pki::{Certificate, CertificateError, Credentials, PkiError};
use common::store::{Store, StoreError};

use crate::config::{default_data_dir, ConfigError, NodeConfig};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const ROOT_FILE_NAME: &str = "root.pem";
pub const NODE_KEY_FILE_NAME: &str = "node.key";
pub const UPSTREAM_FILE_NAME: &str = "upstream.pem";
pub const STORE_DIR_NAME: &str = "store";
pub const STORE_FILE_NAME: &str = "trust.bin";
/// Root credentials kept by whoever created the authority
pub const AUTHORITY_DIR_NAME: &str = "authority";

/// A node's data directory (`~/.rmm` unless overridden)
///
/// ```text
/// config.toml
/// node.key              iroh transport key
/// root.pem              pinned root certificate
/// upstream.pem          pinned server certificate (agents, clients)
/// credentials.pem       this node's certificate
/// credentials.key.pem   this node's password-encrypted key
/// store/trust.bin       registry, revocations, logins, host configs
/// ```
#[derive(Debug, Clone)]
pub struct NodeState {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub node_key_path: PathBuf,
    pub root_path: PathBuf,
    pub store_path: PathBuf,
    pub config: NodeConfig,
}

impl NodeState {
    /// The data directory (custom or default ~/.rmm)
    pub fn data_dir(custom_path: Option<PathBuf>) -> PathBuf {
        custom_path.unwrap_or_else(default_data_dir)
    }

    fn at(data_dir: PathBuf, mut config: NodeConfig) -> Self {
        config.data_dir = data_dir.clone();
        Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            node_key_path: data_dir.join(NODE_KEY_FILE_NAME),
            root_path: data_dir.join(ROOT_FILE_NAME),
            store_path: data_dir.join(STORE_DIR_NAME).join(STORE_FILE_NAME),
            data_dir,
            config,
        }
    }

    /// Create a new data directory with a fresh transport key
    pub fn init(custom_path: Option<PathBuf>, config: NodeConfig) -> Result<Self, StateError> {
        let data_dir = Self::data_dir(custom_path);
        if data_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }
        fs::create_dir_all(data_dir.join(STORE_DIR_NAME))?;

        let state = Self::at(data_dir, config);
        let mut node_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut node_key);
        fs::write(&state.node_key_path, hex::encode(node_key))?;
        state.config.save(&state.config_path)?;

        tracing::info!(dir = %state.data_dir.display(), role = %state.config.role, "initialized node state");
        Ok(state)
    }

    /// Load an existing data directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let data_dir = Self::data_dir(custom_path);
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::NotInitialized);
        }
        let config = NodeConfig::load(&config_path)?;
        let state = Self::at(data_dir, config);
        if !state.node_key_path.exists() {
            return Err(StateError::MissingFile(NODE_KEY_FILE_NAME.to_string()));
        }
        Ok(state)
    }

    pub fn save_config(&self) -> Result<(), StateError> {
        self.config.save(&self.config_path)?;
        Ok(())
    }

    /// The iroh transport key
    pub fn node_key(&self) -> Result<iroh::SecretKey, StateError> {
        let raw = fs::read_to_string(&self.node_key_path)?;
        let bytes: [u8; 32] = hex::decode(raw.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| StateError::InvalidFile(NODE_KEY_FILE_NAME.to_string()))?;
        Ok(iroh::SecretKey::from_bytes(&bytes))
    }

    pub fn open_store(&self) -> Result<Store, StateError> {
        Ok(Store::file(&self.store_path)?)
    }

    pub fn has_root(&self) -> bool {
        self.root_path.exists()
    }

    pub fn load_root(&self) -> Result<Certificate, StateError> {
        read_certificate(&self.root_path)
    }

    pub fn save_root(&self, root: &Certificate) -> Result<(), StateError> {
        fs::write(&self.root_path, root.to_pem())?;
        Ok(())
    }

    fn upstream_path(&self) -> Result<PathBuf, StateError> {
        let path = &self.config.upstream()?.certificate;
        Ok(if path.is_absolute() {
            path.clone()
        } else {
            self.data_dir.join(path)
        })
    }

    /// The pinned certificate of the server this node talks to
    pub fn load_upstream(&self) -> Result<Certificate, StateError> {
        read_certificate(&self.upstream_path()?)
    }

    pub fn save_upstream(&self, certificate: &Certificate) -> Result<(), StateError> {
        fs::write(self.upstream_path()?, certificate.to_pem())?;
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        Credentials::exist_in(&self.data_dir)
    }

    /// This node's credentials, unsealed with the configured password
    pub fn load_credentials(&self) -> Result<Credentials, StateError> {
        if !self.has_credentials() {
            return Err(StateError::MissingCredentials);
        }
        let password = self.config.key_password()?;
        Ok(Credentials::load(&self.data_dir, &password)?)
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> Result<(), StateError> {
        let password = self.config.key_password()?;
        credentials.save(&self.data_dir, &password)?;
        Ok(())
    }

    pub fn authority_dir(&self) -> PathBuf {
        self.data_dir.join(AUTHORITY_DIR_NAME)
    }
}

fn read_certificate(path: &Path) -> Result<Certificate, StateError> {
    if !path.exists() {
        return Err(StateError::MissingFile(path.display().to_string()));
    }
    Ok(Certificate::from_pem(&fs::read_to_string(path)?)?)
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("rmm directory not initialized. Run 'rmm init' first")]
    NotInitialized,

    #[error("rmm directory already initialized")]
    AlreadyInitialized,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("no credentials yet; set up, enroll or log in first")]
    MissingCredentials,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::pki::authority;

    use super::*;
    use crate::config::Role;

    fn config_with_password(var: &str, password: &str) -> NodeConfig {
        std::env::set_var(var, password);
        NodeConfig {
            key_password_env: var.to_string(),
            ..NodeConfig::new(Role::Server, "server-1")
        }
    }

    #[test]
    fn init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node");
        let state = NodeState::init(Some(path.clone()), NodeConfig::new(Role::Agent, "kiosk")).unwrap();
        assert!(state.config_path.exists());
        assert!(state.node_key_path.exists());
        assert!(!state.has_credentials());

        let loaded = NodeState::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.config.role, Role::Agent);
        assert_eq!(loaded.config.data_dir, path);
        assert_eq!(
            loaded.node_key().unwrap().public(),
            state.node_key().unwrap().public()
        );

        assert!(matches!(
            NodeState::init(Some(path), NodeConfig::default()),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn load_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            NodeState::load(Some(dir.path().join("missing"))),
            Err(StateError::NotInitialized)
        ));
    }

    #[test]
    fn credentials_and_root_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_password("RMM_STATE_TEST_PASSWORD", "correct horse");
        let state = NodeState::init(Some(dir.path().to_path_buf()), config).unwrap();
        assert!(matches!(
            state.load_credentials(),
            Err(StateError::MissingCredentials)
        ));

        let root = authority::create_root("acme", Duration::from_secs(3600)).unwrap();
        state.save_root(root.certificate().unwrap()).unwrap();
        state.save_credentials(&root).unwrap();

        let loaded = NodeState::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(
            loaded.load_root().unwrap().der(),
            root.certificate().unwrap().der()
        );
        let credentials = loaded.load_credentials().unwrap();
        assert_eq!(credentials.public_key(), root.public_key());
    }

    #[test]
    fn upstream_paths_are_relative_to_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new(Role::Agent, "kiosk");
        config.upstream = Some(crate::config::UpstreamConfig {
            node_id: "server".into(),
            certificate: UPSTREAM_FILE_NAME.into(),
        });
        let state = NodeState::init(Some(dir.path().to_path_buf()), config).unwrap();
        let root = authority::create_root("acme", Duration::from_secs(3600)).unwrap();
        state.save_upstream(root.certificate().unwrap()).unwrap();
        assert!(dir.path().join(UPSTREAM_FILE_NAME).exists());
        assert_eq!(
            state.load_upstream().unwrap().der(),
            root.certificate().unwrap().der()
        );
    }
}
