use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::host_config::{check_author, HostConfig, HostConfigArtifact};
use crate::pki::{CertificateType, PkiError, SignedArtifact};
use crate::pubsub::Event;
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::b64;
use crate::rpc::session::Session;

/// Publish a signed host configuration to the server
///
/// Only root and user keys may author configurations. The artifact must
/// be fresh and unseen when it arrives, and one that is not strictly newer
/// than the stored one for the same target is refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishHostConfig {
    #[serde(with = "b64")]
    pub artifact: Vec<u8>,
}

impl PublishHostConfig {
    pub fn new(artifact: &HostConfigArtifact) -> Self {
        Self {
            artifact: artifact.to_bytes().to_vec(),
        }
    }
}

#[async_trait]
impl Command for PublishHostConfig {
    const KEY: &'static str = "publish_host_config";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        ctx.require_type(&[CertificateType::Root, CertificateType::User])?;
        let artifact = SignedArtifact::<HostConfig>::from_bytes(&self.artifact)?;

        // Timestamp and nonce first, so nothing is looked up for a replay
        artifact.check_freshness(&ctx.nonces(), ctx.expiration(), clock::now())?;
        let author = check_author(&artifact, ctx.verifier().as_ref(), ctx.revocations()?).await?;

        let target = artifact.body().target.clone();
        let author = author.name().to_string();
        if !ctx.host_configs()?.apply(artifact)? {
            return Err(RpcError::Conflict(format!(
                "a newer configuration for {target} is already stored"
            )));
        }
        tracing::info!(target = %target, author = %author, "host configuration published");
        session.respond_ok().await?;
        Ok(Outcome::Done)
    }
}

/// One change pushed down a sync session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// Serialized [`HostConfigArtifact`]
    Upsert(Vec<u8>),
    Remove(String),
}

impl SyncEvent {
    /// Decode an upsert's artifact; `None` for removals
    pub fn artifact(&self) -> Result<Option<HostConfigArtifact>, PkiError> {
        match self {
            SyncEvent::Upsert(bytes) => SignedArtifact::from_bytes(bytes).map(Some),
            SyncEvent::Remove(_) => Ok(None),
        }
    }
}

/// Stream host configurations as they change
///
/// The server first replays what it holds, then pushes every later change
/// until either side goes away. Agents only see their own configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncHostConfigs {}

impl SyncHostConfigs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for SyncHostConfigs {
    const KEY: &'static str = "sync_host_configs";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let peer = ctx.require_type(&[
            CertificateType::Root,
            CertificateType::User,
            CertificateType::Agent,
        ])?;
        let only = (peer.kind() == CertificateType::Agent).then(|| peer.name().to_string());
        let wanted = |target: &str| only.as_deref().map_or(true, |name| name == target);

        let (snapshot, subscription) = ctx.host_configs()?.subscribe();
        session.respond_ok().await?;
        for artifact in snapshot {
            if wanted(&artifact.body().target) {
                session
                    .send(&SyncEvent::Upsert(artifact.to_bytes().to_vec()))
                    .await?;
            }
        }

        loop {
            let event = tokio::select! {
                event = subscription.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = ctx.connection.closed() => break,
            };
            let message = match event {
                Event::Upsert(target, artifact) if wanted(&target) => {
                    SyncEvent::Upsert(artifact.to_bytes().to_vec())
                }
                Event::Remove(target) if wanted(&target) => SyncEvent::Remove(target),
                _ => continue,
            };
            if let Err(e) = session.send(&message).await {
                tracing::debug!(peer = %peer.name(), "host config sync ended: {}", e);
                break;
            }
        }
        Ok(Outcome::Done)
    }
}

/// Next change on a session that ran [`SyncHostConfigs`]
pub async fn next_event(session: &mut Session) -> Result<SyncEvent, RpcError> {
    session.recv().await
}
