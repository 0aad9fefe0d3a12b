use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::kdf::KEY_SIZE;

/// Size of a CFB initialization vector (one AES block)
pub const IV_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
#[error("invalid cipher key or iv length")]
pub struct CipherError;

/// AES-256-CFB over an async byte stream
///
/// Each direction has its own IV so the two keystreams never overlap.
/// Ciphertext that the inner stream has not yet accepted is kept in a
/// pending buffer and drained before any further write or flush, so a
/// partial write never re-encrypts (and thereby desynchronizes) data.
pub struct CipherStream<S> {
    inner: S,
    encryptor: BufEncryptor<Aes256>,
    decryptor: BufDecryptor<Aes256>,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> CipherStream<S> {
    pub fn new(
        inner: S,
        key: &[u8; KEY_SIZE],
        write_iv: &[u8; IV_SIZE],
        read_iv: &[u8; IV_SIZE],
    ) -> Result<Self, CipherError> {
        let encryptor =
            BufEncryptor::<Aes256>::new_from_slices(key, write_iv).map_err(|_| CipherError)?;
        let decryptor =
            BufDecryptor::<Aes256>::new_from_slices(key, read_iv).map_err(|_| CipherError)?;
        Ok(Self {
            inner,
            encryptor,
            decryptor,
            pending: Vec::new(),
            offset: 0,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.offset < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.offset..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.offset += n;
        }
        self.pending.clear();
        self.offset = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.decryptor.decrypt(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.pending.extend_from_slice(data);
        this.encryptor.encrypt(&mut this.pending);

        // The plaintext is consumed once it has been encrypted; anything
        // the inner stream did not take yet goes out on the next poll.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
