//! Multiplexed transports the RPC layer runs over
//!
//! A transport is one authenticated-or-not link to a single peer that can
//! open and accept independent bidirectional byte streams. QUIC through
//! iroh is the production transport; an in-memory pair backs the tests.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::RpcError;

pub mod quic;
pub mod memory;

/// A bidirectional byte stream within a transport
pub trait RpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RpcStream for T {}

pub type BoxStream = Box<dyn RpcStream>;

#[async_trait]
pub trait Transport: Send + Sync + Debug + 'static {
    async fn open_stream(&self) -> Result<BoxStream, RpcError>;

    /// Next stream opened by the peer; errors once the transport is closed
    async fn accept_stream(&self) -> Result<BoxStream, RpcError>;

    /// Our transport-level identity on this link
    fn local_id(&self) -> String;

    /// The peer's transport-level identity
    fn remote_id(&self) -> String;

    fn remote_address(&self) -> String;

    /// Tear the link down; every open stream fails afterwards
    fn close(&self);
}
