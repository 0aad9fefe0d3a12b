use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::clock;
use crate::crypto::{CipherStream, IV_SIZE, KEY_SIZE};

use super::command::ClientCall;
use super::connection::SessionGuard;
use super::error::{RpcError, Status};
use super::header::{self, RequestHeader, ResponseHeader, DELIMITER, MAX_HEADER_SIZE};
use super::rewind::Rewind;
use super::transport::BoxStream;

/// Largest application frame accepted by [`Session::recv`]
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Lifecycle of a session
///
/// Moves only forward: `Created -> Open -> [Encrypted] -> Closed`.
/// `Encrypted` is still an open session, just over a cipher stream; a
/// further encryption layer keeps it `Encrypted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Open,
    Encrypted,
    Closed,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Open)
                | (Created, Closed)
                | (Open, Encrypted)
                | (Open, Closed)
                | (Encrypted, Encrypted)
                | (Encrypted, Closed)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Encrypted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Open => "open",
            SessionState::Encrypted => "encrypted",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One bidirectional stream within a connection
///
/// Framing on a session is strictly sequential: a JSON request header
/// line, a JSON response header line, then whatever length-prefixed
/// frames the command exchanges.
pub struct Session {
    id: u64,
    state: SessionState,
    stream: Option<BufReader<BoxStream>>,
    responded: bool,
    _guard: Option<SessionGuard>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Session {
    pub fn new(id: u64, stream: BoxStream) -> Self {
        Self {
            id,
            state: SessionState::Created,
            stream: Some(BufReader::new(stream)),
            responded: false,
            _guard: None,
        }
    }

    pub(crate) fn with_guard(mut self, guard: SessionGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.state == SessionState::Encrypted
    }

    /// Move to `next`, leaving the state untouched if that is not allowed
    pub fn transition(&mut self, next: SessionState) -> Result<(), RpcError> {
        if !self.state.can_move_to(next) {
            return Err(RpcError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(session = self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    pub fn open(&mut self) -> Result<(), RpcError> {
        self.transition(SessionState::Open)
    }

    fn stream(&mut self) -> Result<&mut BufReader<BoxStream>, RpcError> {
        if !self.state.is_open() {
            return Err(RpcError::SessionClosed);
        }
        self.stream.as_mut().ok_or(RpcError::SessionClosed)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, RpcError> {
        let stream = self.stream()?;
        let mut line = Vec::new();
        let read = (&mut *stream)
            .take(MAX_HEADER_SIZE as u64)
            .read_until(DELIMITER, &mut line)
            .await?;
        if read == 0 {
            return Err(RpcError::SessionClosed);
        }
        if line.last() != Some(&DELIMITER) {
            return Err(RpcError::MalformedHeader(if read >= MAX_HEADER_SIZE {
                "header too long".into()
            } else {
                "stream ended inside a header".into()
            }));
        }
        Ok(line)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        let stream = self.stream()?.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn read_request(&mut self) -> Result<RequestHeader, RpcError> {
        let line = self.read_line().await?;
        let request: RequestHeader = header::decode_line(&line)?;
        tracing::debug!(session = self.id, cmd = %request.cmd, "read request header");
        self.responded = false;
        Ok(request)
    }

    pub async fn write_request(&mut self, request: &RequestHeader) -> Result<(), RpcError> {
        tracing::debug!(session = self.id, cmd = %request.cmd, "write request header");
        self.write_all(&header::encode_line(request)?).await
    }

    pub async fn read_response(&mut self) -> Result<ResponseHeader, RpcError> {
        let line = self.read_line().await?;
        let response: ResponseHeader = header::decode_line(&line)?;
        tracing::debug!(session = self.id, code = response.code, "read response header");
        Ok(response)
    }

    /// Send the response header for the current request
    pub async fn respond_with(&mut self, response: ResponseHeader) -> Result<(), RpcError> {
        self.responded = true;
        tracing::debug!(session = self.id, code = response.code, msg = %response.msg, "write response header");
        self.write_all(&header::encode_line(&response)?).await
    }

    pub async fn respond(&mut self, status: Status, msg: impl Into<String>) -> Result<(), RpcError> {
        self.respond_with(ResponseHeader::new(status, msg)).await
    }

    pub async fn respond_ok(&mut self) -> Result<(), RpcError> {
        self.respond_with(ResponseHeader::ok()).await
    }

    /// Whether the current request already has its response header
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Write one length-prefixed application frame
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), RpcError> {
        let body = bincode::serialize(message)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        self.write_all(&frame).await
    }

    /// Read one length-prefixed application frame
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, RpcError> {
        let stream = self.stream()?;
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok(bincode::deserialize(&body)?)
    }

    /// Run a command from the initiating side
    ///
    /// The client half of the command only runs after a `200` response.
    pub async fn call<C: ClientCall + ?Sized>(
        &mut self,
        command: &mut C,
    ) -> Result<ResponseHeader, RpcError> {
        let request = RequestHeader {
            cmd: command.key().to_string(),
            timestamp: clock::now(),
            args: command.args()?,
        };
        self.write_request(&request).await?;
        let response = self.read_response().await?;
        if !response.is_ok() {
            tracing::debug!(
                session = self.id,
                cmd = %request.cmd,
                code = response.code,
                msg = %response.msg,
                "command rejected"
            );
            return Err(response.into_error());
        }
        command.complete(self, &response).await?;
        Ok(response)
    }

    /// Replace the stream with an AES-CFB wrapped one
    ///
    /// Read-ahead already buffered is ciphertext from the peer and is fed
    /// through the new cipher first.
    pub fn encrypt(
        &mut self,
        key: &[u8; KEY_SIZE],
        write_iv: &[u8; IV_SIZE],
        read_iv: &[u8; IV_SIZE],
    ) -> Result<(), RpcError> {
        if !self.state.can_move_to(SessionState::Encrypted) {
            return Err(RpcError::InvalidTransition {
                from: self.state,
                to: SessionState::Encrypted,
            });
        }
        let raw = self.take_raw()?;
        let cipher = CipherStream::new(raw, key, write_iv, read_iv)?;
        let wrapped: BoxStream = Box::new(cipher);
        self.stream = Some(BufReader::new(wrapped));
        self.transition(SessionState::Encrypted)
    }

    fn take_raw(&mut self) -> Result<BoxStream, RpcError> {
        if !self.state.is_open() {
            return Err(RpcError::SessionClosed);
        }
        let reader = self.stream.take().ok_or(RpcError::SessionClosed)?;
        let buffered = reader.buffer().to_vec();
        let inner = reader.into_inner();
        if buffered.is_empty() {
            Ok(inner)
        } else {
            Ok(Box::new(Rewind::new(buffered, inner)))
        }
    }

    /// Hand the underlying stream to the caller (for splicing)
    ///
    /// The session stays open in name until [`Session::close`].
    pub fn take_stream(&mut self) -> Result<BoxStream, RpcError> {
        self.take_raw()
    }

    /// Shut the stream down and mark the session closed
    ///
    /// Closing a session never closes its connection.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            tracing::trace!(session = self.id, "session closed");
        }
        self._guard = None;
    }
}
