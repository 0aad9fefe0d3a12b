use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::{BoxStream, Transport};
use crate::rpc::error::RpcError;

const STREAM_BUFFER: usize = 64 * 1024;

/// One end of an in-process transport
#[derive(Debug)]
pub struct MemoryTransport {
    local_id: String,
    remote_id: String,
    outgoing: mpsc::UnboundedSender<DuplexStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
}

/// Two connected transports; closing either end closes both
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let a_id = format!("mem-{}", uuid::Uuid::new_v4());
    let b_id = format!("mem-{}", uuid::Uuid::new_v4());
    let a = MemoryTransport {
        local_id: a_id.clone(),
        remote_id: b_id.clone(),
        outgoing: b_tx,
        incoming: Mutex::new(a_rx),
        closed: closed.clone(),
    };
    let b = MemoryTransport {
        local_id: b_id,
        remote_id: a_id,
        outgoing: a_tx,
        incoming: Mutex::new(b_rx),
        closed,
    };
    (a, b)
}

impl MemoryTransport {
    fn wrap(&self, inner: DuplexStream) -> BoxStream {
        Box::new(MemoryStream {
            inner,
            closed: Box::pin(self.closed.clone().cancelled_owned()),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_stream(&self) -> Result<BoxStream, RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        self.outgoing
            .send(theirs)
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok(self.wrap(ours))
    }

    async fn accept_stream(&self) -> Result<BoxStream, RpcError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(RpcError::ConnectionClosed),
            stream = incoming.recv() => match stream {
                Some(stream) => Ok(self.wrap(stream)),
                None => Err(RpcError::ConnectionClosed),
            },
        }
    }

    fn local_id(&self) -> String {
        self.local_id.clone()
    }

    fn remote_id(&self) -> String {
        self.remote_id.clone()
    }

    fn remote_address(&self) -> String {
        format!("memory://{}", self.remote_id)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Duplex stream that fails as soon as its transport closes
struct MemoryStream {
    inner: DuplexStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MemoryStream {
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        match self.closed.poll_unpin(cx) {
            Poll::Ready(()) => Some(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transport closed",
            )),
            Poll::Pending => None,
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
