use clap::Args;

use service::config::UpstreamConfig;
use service::node::{client, NodeError};
use service::state::UPSTREAM_FILE_NAME;

use crate::cli::op;

/// Sign in on a new machine with a username and password
///
/// The password both unlocks the account and seals the key saved here.
#[derive(Args, Debug, Clone)]
pub struct Login {
    /// Server node id
    #[arg(long)]
    pub server: String,

    #[arg(long)]
    pub username: String,
}

#[async_trait::async_trait]
impl op::Op for Login {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut state = ctx.state()?;
        let password = state.config.key_password()?;

        let endpoint = op::endpoint(&state).await?;
        let result = client::login(&endpoint, &self.server, &self.username, &password).await;
        endpoint.close().await;
        let result = result?;

        state.config.upstream = Some(UpstreamConfig {
            node_id: self.server.clone(),
            certificate: UPSTREAM_FILE_NAME.into(),
        });
        state.save_config()?;
        let credentials = client::store_login(&state, &result, &password)?;
        Ok(format!(
            "logged in as '{}' ({})",
            self.username,
            credentials.public_key().fingerprint()
        ))
    }
}
