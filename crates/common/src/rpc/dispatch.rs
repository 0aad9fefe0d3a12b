use crate::clock;

use super::command::Outcome;
use super::context::Context;
use super::error::{RpcError, Status};
use super::session::Session;

/// Serve one incoming session until its command is done
///
/// Runs as a loop so that a session which negotiated encryption reads its
/// next request through the new stream without growing the stack. Every
/// failure here ends this session only.
pub async fn handle_incoming(mut session: Session, ctx: Context) {
    loop {
        let request = match session.read_request().await {
            Ok(request) => request,
            Err(RpcError::SessionClosed) => break,
            Err(e) => {
                tracing::warn!(session = session.id(), remote = %ctx.connection.remote_id(), "abandoning session: {}", e);
                break;
            }
        };

        if !clock::within_window(request.timestamp, clock::now(), ctx.expiration()) {
            tracing::warn!(session = session.id(), cmd = %request.cmd, "stale request");
            let _ = session
                .respond(Status::Timeout, RpcError::Expired.to_string())
                .await;
            break;
        }

        let handler = match ctx.commands.decode(&request) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::debug!(session = session.id(), cmd = %request.cmd, "rejecting request: {}", e);
                let _ = session.respond(e.status(), e.to_string()).await;
                break;
            }
        };

        let key = handler.key();
        match handler.run(&mut session, &ctx).await {
            Ok(Outcome::Continue) => continue,
            Ok(Outcome::Done) => break,
            Err(e) => {
                if session.responded() {
                    tracing::debug!(session = session.id(), cmd = key, "command ended: {}", e);
                } else {
                    tracing::warn!(session = session.id(), cmd = key, "command failed: {}", e);
                    let _ = session.respond(e.status(), e.to_string()).await;
                }
                break;
            }
        }
    }
    session.close().await;
}
