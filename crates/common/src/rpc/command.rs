use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::context::Context;
use super::error::RpcError;
use super::header::{self, RequestHeader, ResponseHeader};
use super::session::Session;

/// What the dispatch loop does after a server handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command is finished; close the session
    Done,
    /// Read another request header from the same session (after the
    /// stream was swapped, e.g. by an encryption handshake)
    Continue,
}

/// An RPC command
///
/// The serialized form of the command is its argument map. A command
/// usually implements only the side it participates in; the other side
/// keeps the default.
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KEY: &'static str;

    /// Handle the command on the responding side
    async fn execute_server(
        self,
        _session: &mut Session,
        _ctx: &Context,
    ) -> Result<Outcome, RpcError> {
        Err(RpcError::Unsupported(Self::KEY))
    }

    /// Continue the command on the initiating side after a `200`
    async fn execute_client(
        &mut self,
        _session: &mut Session,
        _response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Object-safe view of a command on the initiating side
#[async_trait]
pub trait ClientCall: Send {
    fn key(&self) -> &'static str;

    fn args(&self) -> Result<Map<String, Value>, RpcError>;

    async fn complete(
        &mut self,
        session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError>;
}

#[async_trait]
impl<C: Command> ClientCall for C {
    fn key(&self) -> &'static str {
        C::KEY
    }

    fn args(&self) -> Result<Map<String, Value>, RpcError> {
        header::to_args(self)
    }

    async fn complete(
        &mut self,
        session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        self.execute_client(session, response).await
    }
}

/// Object-safe view of a decoded command on the responding side
#[async_trait]
pub trait Handler: Send {
    fn key(&self) -> &'static str;

    async fn run(self: Box<Self>, session: &mut Session, ctx: &Context)
        -> Result<Outcome, RpcError>;
}

#[async_trait]
impl<C: Command> Handler for C {
    fn key(&self) -> &'static str {
        C::KEY
    }

    async fn run(
        self: Box<Self>,
        session: &mut Session,
        ctx: &Context,
    ) -> Result<Outcome, RpcError> {
        (*self).execute_server(session, ctx).await
    }
}

type Factory = Arc<dyn Fn(Map<String, Value>) -> Result<Box<dyn Handler>, RpcError> + Send + Sync>;

/// Command key -> typed decoder
///
/// Which commands a peer may run is decided by which collection its
/// listener was built with, before any request is read.
#[derive(Clone, Default)]
pub struct CommandCollection {
    factories: HashMap<&'static str, Factory>,
}

impl fmt::Debug for CommandCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("CommandCollection").field("commands", &keys).finish()
    }
}

impl CommandCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Command>(mut self) -> Self {
        self.factories.insert(
            C::KEY,
            Arc::new(|args| {
                let command: C = serde_json::from_value(Value::Object(args))
                    .map_err(|e| RpcError::BadRequest(format!("{}: {}", C::KEY, e)))?;
                Ok(Box::new(command) as Box<dyn Handler>)
            }),
        );
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Decode a request header into its command
    pub fn decode(&self, request: &RequestHeader) -> Result<Box<dyn Handler>, RpcError> {
        let factory = self
            .factories
            .get(request.cmd.as_str())
            .ok_or_else(|| RpcError::UnknownCommand(request.cmd.clone()))?;
        factory(request.args.clone())
    }
}
