use std::fmt::Write;
use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};

use common::pki::Certificate;
use service::node::{Client, NodeError};

use crate::cli::op;

fn read_certificate(path: &Path) -> Result<Certificate, NodeError> {
    let pem = std::fs::read_to_string(path).map_err(service::StateError::from)?;
    Ok(Certificate::from_pem(&pem).map_err(service::StateError::from)?)
}

/// Run `f` against the configured server, closing the link afterwards
async fn with_client<T, F>(ctx: &op::OpContext, f: F) -> Result<T, NodeError>
where
    F: for<'a> FnOnce(&'a Client) -> futures::future::BoxFuture<'a, Result<T, NodeError>>,
{
    let state = ctx.state()?;
    let endpoint = op::endpoint(&state).await?;
    let result = match Client::connect(&state, &endpoint).await {
        Ok(client) => {
            let result = f(&client).await;
            client.close();
            result
        }
        Err(e) => Err(e),
    };
    endpoint.close().await;
    result
}

#[derive(Subcommand, Debug, Clone)]
pub enum EnrollmentsCommand {
    /// Devices waiting for an operator
    List,
    /// Issue a certificate to a waiting device
    Accept {
        /// Key fingerprint shown by `list`
        fingerprint: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Enrollments {
    #[command(subcommand)]
    pub command: EnrollmentsCommand,
}

#[async_trait::async_trait]
impl op::Op for Enrollments {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let command = self.command.clone();
        with_client(ctx, move |client| {
            Box::pin(async move {
                match command {
                    EnrollmentsCommand::List => {
                        let mut out = String::new();
                        for pending in client.list_enrollments().await? {
                            let _ = writeln!(
                                out,
                                "{}  {}  {}  {:?}",
                                pending.fingerprint(),
                                pending.name,
                                pending.address,
                                pending.state
                            );
                        }
                        if out.is_empty() {
                            out.push_str("no pending enrollments");
                        }
                        Ok(out)
                    }
                    EnrollmentsCommand::Accept { fingerprint } => {
                        let certificate = client.accept_enrollment(&fingerprint).await?;
                        Ok(format!("enrolled '{}'", certificate.name()))
                    }
                }
            })
        })
        .await
    }
}

/// Check that the server, or an agent through it, answers
#[derive(Args, Debug, Clone)]
pub struct Ping {
    /// PEM certificate of an agent to reach through the server
    #[arg(long)]
    pub target: Option<PathBuf>,

    #[arg(long, default_value = "ping")]
    pub payload: String,
}

#[async_trait::async_trait]
impl op::Op for Ping {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let target = self.target.as_deref().map(read_certificate).transpose()?;
        let payload = self.payload.clone();
        with_client(ctx, move |client| {
            Box::pin(async move {
                match target {
                    Some(target) => {
                        client.ping_through(&target, &payload).await?;
                        Ok(format!("'{}' answered", target.name()))
                    }
                    None => {
                        client.ping(&payload).await?;
                        Ok("server answered".to_string())
                    }
                }
            })
        })
        .await
    }
}

/// Revoke a certificate on the server
#[derive(Args, Debug, Clone)]
pub struct Revoke {
    /// PEM certificate to revoke
    pub certificate: PathBuf,
}

#[async_trait::async_trait]
impl op::Op for Revoke {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let certificate = read_certificate(&self.certificate)?;
        with_client(ctx, move |client| {
            Box::pin(async move {
                client.revoke(&certificate).await?;
                Ok(format!("revoked '{}'", certificate.name()))
            })
        })
        .await
    }
}
