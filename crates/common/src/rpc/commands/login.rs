use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedKey;
use crate::pki::{Certificate, Credentials, PkiError};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::ResponseHeader;
use crate::rpc::session::Session;

/// Everything a user needs to act from a fresh machine
///
/// The key is still sealed with the user's password; it is only opened on
/// the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    pub certificate: Certificate,
    pub key: EncryptedKey,
    pub root: Certificate,
    pub server: Certificate,
}

impl LoginResult {
    pub fn credentials(&self, password: &str) -> Result<Credentials, PkiError> {
        Credentials::new(self.certificate.clone(), self.key.decrypt(password)?)
    }
}

/// Username/password sign-in on the login protocol
#[derive(Clone, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
    #[serde(skip)]
    result: Option<LoginResult>,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Login {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            result: None,
        }
    }

    pub fn result(&self) -> Option<&LoginResult> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<LoginResult> {
        self.result
    }
}

#[async_trait]
impl Command for Login {
    const KEY: &'static str = "login";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let record = ctx
            .logins()?
            .verify(&self.username, &self.password)?
            .ok_or_else(|| {
                tracing::warn!(username = %self.username, "failed login");
                RpcError::Unauthorized("invalid username or password".into())
            })?;
        let result = LoginResult {
            certificate: record.certificate,
            key: record.key,
            root: ctx.trust()?.root().clone(),
            server: ctx.identity()?.clone(),
        };
        session.respond_ok().await?;
        session.send(&result).await?;
        tracing::info!(username = %self.username, "user logged in");
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        session: &mut Session,
        _response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        self.result = Some(session.recv().await?);
        Ok(())
    }
}
