use clap::Args;

use service::config::Role;
use service::node::{self, Agent, NodeError, Server};
use service::{logging, process};

use crate::cli::op;

/// Run this node until SIGINT or SIGTERM
#[derive(Args, Debug, Clone)]
pub struct Run;

#[async_trait::async_trait]
impl op::Op for Run {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let _guards = logging::init_logging(state.config.log_level()?, state.config.log_dir.as_deref());
        process::register_panic_logger();
        process::report_build_info(&state.config.role.to_string());

        let (graceful_waiter, _shutdown_tx, mut shutdown_rx) = process::graceful_shutdown_blocker()
            .map_err(|e| NodeError::Refused(format!("cannot install signal handlers: {e}")))?;

        match state.config.role {
            Role::Server => {
                if !state.has_credentials() {
                    let endpoint = node::bind_endpoint(state.node_key()?, state.config.listen_addr).await?;
                    Server::setup(&state, endpoint, &mut shutdown_rx).await?;
                }
                let endpoint = node::bind_endpoint(state.node_key()?, state.config.listen_addr).await?;
                Server::open(state)?.run(endpoint, shutdown_rx).await?;
            }
            Role::Agent => {
                let endpoint = node::bind_endpoint(state.node_key()?, state.config.listen_addr).await?;
                if !state.has_credentials() {
                    tokio::select! {
                        enrolled = Agent::enroll(&state, &endpoint) => { enrolled?; }
                        _ = shutdown_rx.changed() => return Err(NodeError::Interrupted),
                    }
                }
                Agent::open(state)?.run(endpoint, shutdown_rx).await?;
            }
            Role::Client => {
                return Err(NodeError::Refused(
                    "client nodes do not run; use the operator commands".into(),
                ))
            }
        }

        graceful_waiter.abort();
        Ok("node stopped".to_string())
    }
}
