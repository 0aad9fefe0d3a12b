use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::{self, ResponseHeader};
use crate::rpc::session::Session;

/// Liveness check; the server echoes the payload back in `info`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ping {
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    payload: String,
}

impl Ping {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

#[async_trait]
impl Command for Ping {
    const KEY: &'static str = "ping";

    async fn execute_server(self, session: &mut Session, _ctx: &Context) -> Result<Outcome, RpcError> {
        session
            .respond_with(ResponseHeader::ok().with_info(json!({ "payload": self.payload })))
            .await?;
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        _session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        let pong: Pong = header::parse_info(response)?;
        if pong.payload != self.payload {
            return Err(RpcError::Encoding("ping payload was not echoed".into()));
        }
        Ok(())
    }
}
