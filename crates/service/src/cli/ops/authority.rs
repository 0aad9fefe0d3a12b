use std::time::Duration;

use clap::Args;

use common::crypto::SecretKey;
use common::pki::{authority, CertificateType, Credentials};
use service::config::UpstreamConfig;
use service::node::{client, NodeError};
use service::state::UPSTREAM_FILE_NAME;

use crate::cli::op;

const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const ADMIN_VALIDITY: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// Create a root and the first administrator in this data directory
#[derive(Args, Debug, Clone)]
pub struct Authority {
    /// Name of the root certificate
    #[arg(long)]
    pub root_name: String,
}

#[async_trait::async_trait]
impl op::Op for Authority {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        if state.has_root() {
            return Err(NodeError::Refused("a root is already pinned here".into()));
        }
        let password = state.config.key_password()?;

        let root = authority::create_root(&self.root_name, ROOT_VALIDITY)?;
        root.save(&state.authority_dir(), &password)?;

        let key = SecretKey::generate();
        let certificate = authority::issue(
            &root,
            &key.public(),
            &state.config.name,
            CertificateType::User,
            ADMIN_VALIDITY,
        )?;
        let admin = Credentials::new(certificate, key)?;
        state.save_root(root.certificate()?)?;
        state.save_credentials(&admin)?;

        Ok(format!(
            "created root '{}' and administrator '{}' ({})",
            self.root_name,
            state.config.name,
            admin.public_key().fingerprint()
        ))
    }
}

/// Set up a fresh server as this administrator
#[derive(Args, Debug, Clone)]
pub struct Setup {
    /// Node id the server printed while waiting for setup
    #[arg(long)]
    pub server: String,

    /// Certificate name for the server
    #[arg(long)]
    pub server_name: String,

    /// Also create a password login with this username
    #[arg(long)]
    pub login: Option<String>,
}

#[async_trait::async_trait]
impl op::Op for Setup {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut state = ctx.state()?;
        let admin = state.load_credentials()?;
        let root = state.load_root()?;
        let password = state.config.key_password()?;

        let endpoint = op::endpoint(&state).await?;
        let login = self
            .login
            .as_deref()
            .map(|username| (username, password.as_str()));
        let certificate = client::setup_server(
            &endpoint,
            &self.server,
            &root,
            &admin,
            &self.server_name,
            login,
        )
        .await;
        endpoint.close().await;
        let certificate = certificate?;

        state.config.upstream = Some(UpstreamConfig {
            node_id: self.server.clone(),
            certificate: UPSTREAM_FILE_NAME.into(),
        });
        state.save_config()?;
        state.save_upstream(&certificate)?;
        Ok(format!(
            "server '{}' is set up; its certificate is pinned in {}",
            certificate.name(),
            state.data_dir.join(UPSTREAM_FILE_NAME).display()
        ))
    }
}
