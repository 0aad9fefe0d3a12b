use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use service::config::{NodeConfig, Role, UpstreamConfig};
use service::state::{NodeState, StateError, UPSTREAM_FILE_NAME};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// What this node will run as
    #[arg(long, value_enum, default_value_t = Role::Server)]
    pub role: Role,

    /// Certificate name to set up or enroll under
    #[arg(long)]
    pub name: String,

    /// Listen address for the iroh endpoint
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Server node id (agents and clients)
    #[arg(long)]
    pub upstream: Option<String>,

    /// PEM file with the server certificate to pin (agents)
    #[arg(long)]
    pub upstream_certificate: Option<PathBuf>,

    /// Allow TCP tunnels through this agent
    #[arg(long)]
    pub tunnels: bool,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = NodeConfig::new(self.role, &self.name);
        config.listen_addr = self.listen_addr;
        config.tunnels = self.tunnels;
        config.log_dir = self.log_dir.clone();
        config.upstream = self.upstream.clone().map(|node_id| UpstreamConfig {
            node_id,
            certificate: UPSTREAM_FILE_NAME.into(),
        });

        let state = NodeState::init(ctx.data_dir.clone(), config)?;
        if let Some(path) = &self.upstream_certificate {
            std::fs::copy(path, state.data_dir.join(UPSTREAM_FILE_NAME))?;
        }
        Ok(format!(
            "initialized {} node '{}' in {}",
            self.role,
            self.name,
            state.data_dir.display()
        ))
    }
}
