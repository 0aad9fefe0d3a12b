use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::pki::CertificateType;
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::session::Session;
use crate::rpc::splice::{splice, SpliceStats};

/// Open a TCP connection from the agent and pipe it through the session
///
/// Runs on an agent, usually inside a relayed and encrypted session. The
/// agent must have tunnels enabled in its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpForward {
    /// `host:port` as seen from the agent
    pub address: String,
}

impl TcpForward {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Command for TcpForward {
    const KEY: &'static str = "tcp_forward";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        if !ctx.capabilities.tunnels {
            return Err(RpcError::Unavailable("tcp tunnels"));
        }
        let peer = ctx.require_type(&[
            CertificateType::Root,
            CertificateType::User,
            CertificateType::Server,
        ])?;
        let socket = TcpStream::connect(&self.address).await.map_err(|e| {
            tracing::warn!(address = %self.address, "tcp forward failed: {}", e);
            RpcError::Dial(format!("{}: {}", self.address, e))
        })?;
        session.respond_ok().await?;
        tracing::info!(peer = %peer.name(), address = %self.address, "tcp tunnel open");

        let stats = splice(session.take_stream()?, Box::new(socket)).await?;
        tracing::debug!(
            address = %self.address,
            sent = stats.b_to_a,
            received = stats.a_to_b,
            "tcp tunnel closed"
        );
        Ok(Outcome::Done)
    }
}

/// Pipe a local socket through a session that ran [`TcpForward`]
pub async fn tunnel(session: &mut Session, socket: TcpStream) -> Result<SpliceStats, RpcError> {
    let stream = session.take_stream()?;
    let result = splice(Box::new(socket), stream).await;
    session.close().await;
    result
}
