use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{BoxStream, Transport};
use crate::rpc::error::RpcError;

/// QUIC connection through iroh
#[derive(Debug, Clone)]
pub struct IrohTransport {
    conn: Connection,
    local_id: String,
}

impl IrohTransport {
    pub fn new(conn: Connection, local_id: impl Into<String>) -> Self {
        Self {
            conn,
            local_id: local_id.into(),
        }
    }

    /// Dial `addr` on `alpn`
    pub async fn connect(
        endpoint: &Endpoint,
        addr: impl Into<NodeAddr>,
        alpn: &[u8],
    ) -> Result<Self, RpcError> {
        let addr = addr.into();
        let conn = endpoint.connect(addr.clone(), alpn).await.map_err(|e| {
            tracing::error!("failed to connect to {:?}: {}", addr.node_id, e);
            RpcError::Dial(e.to_string())
        })?;
        tracing::debug!(peer = %addr.node_id, alpn = %String::from_utf8_lossy(alpn), "connected");
        Ok(Self::new(conn, endpoint.node_id().to_string()))
    }
}

#[async_trait]
impl Transport for IrohTransport {
    async fn open_stream(&self) -> Result<BoxStream, RpcError> {
        let (send, recv) = self.conn.open_bi().await.map_err(|e| {
            tracing::debug!("failed to open bidirectional stream: {}", e);
            RpcError::Io(io::Error::other(e))
        })?;
        Ok(Box::new(IrohStream { send, recv }))
    }

    async fn accept_stream(&self) -> Result<BoxStream, RpcError> {
        let (send, recv) = self
            .conn
            .accept_bi()
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok(Box::new(IrohStream { send, recv }))
    }

    fn local_id(&self) -> String {
        self.local_id.clone()
    }

    fn remote_id(&self) -> String {
        self.conn
            .remote_node_id()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    fn remote_address(&self) -> String {
        self.remote_id()
    }

    fn close(&self) {
        self.conn.close(0u32.into(), b"closed");
    }
}

/// One QUIC bidirectional stream as a single read/write object
struct IrohStream {
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for IrohStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}
