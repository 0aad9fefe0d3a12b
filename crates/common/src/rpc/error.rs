use std::fmt;

use crate::crypto::{CipherError, KdfError, KeyError};
use crate::enrollment::EnrollmentError;
use crate::pki::PkiError;
use crate::store::StoreError;

use super::session::SessionState;

/// Response status carried in every response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    Conflict,
    Internal,
    BadGateway,
    Unavailable,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Timeout => 408,
            Status::Conflict => 409,
            Status::Internal => 500,
            Status::BadGateway => 502,
            Status::Unavailable => 503,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            200 => Status::Ok,
            400 => Status::BadRequest,
            401 => Status::Unauthorized,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            408 => Status::Timeout,
            409 => Status::Conflict,
            500 => Status::Internal,
            502 => Status::BadGateway,
            503 => Status::Unavailable,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("command {0} is not handled on this side")]
    Unsupported(&'static str),
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("session closed")]
    SessionClosed,
    #[error("request outside the freshness window")]
    Expired,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} is not available on this node")]
    Unavailable(&'static str),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("remote error {code}: {msg}")]
    Remote { code: u16, msg: String },
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Encoding(e.to_string())
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::Encoding(e.to_string())
    }
}

/// Status a trust failure is reported with
pub fn pki_status(error: &PkiError) -> Status {
    match error {
        PkiError::PermissionDenied(_) => Status::Forbidden,
        PkiError::CertificateNotVerified(_)
        | PkiError::SignatureInvalid
        | PkiError::Revoked
        | PkiError::UnknownKey(_)
        | PkiError::ChainBuildFailed(_) => Status::Unauthorized,
        PkiError::ReplayDetected => Status::Conflict,
        PkiError::Expired(_) => Status::Timeout,
        PkiError::VerifierUnreachable(_) => Status::Unavailable,
        PkiError::Certificate(_) | PkiError::Key(_) | PkiError::Encoding(_) => Status::BadRequest,
        PkiError::Store(_) | PkiError::Io(_) => Status::Internal,
    }
}

impl RpcError {
    pub fn status(&self) -> Status {
        match self {
            RpcError::Io(_) | RpcError::ConnectionClosed | RpcError::SessionClosed => {
                Status::Internal
            }
            RpcError::Encoding(_)
            | RpcError::MalformedHeader(_)
            | RpcError::Unsupported(_)
            | RpcError::BadRequest(_)
            | RpcError::FrameTooLarge(_)
            | RpcError::Key(_)
            | RpcError::Cipher(_)
            | RpcError::Kdf(_) => Status::BadRequest,
            RpcError::UnknownCommand(_) => Status::NotFound,
            RpcError::Unauthorized(_) => Status::Unauthorized,
            RpcError::Conflict(_) => Status::Conflict,
            RpcError::InvalidTransition { .. } => Status::Conflict,
            RpcError::Expired => Status::Timeout,
            RpcError::Unavailable(_) => Status::Unavailable,
            RpcError::Dial(_) => Status::BadGateway,
            RpcError::Remote { code, .. } => Status::from_code(*code).unwrap_or(Status::Internal),
            RpcError::Pki(e) => pki_status(e),
            RpcError::Store(_) => Status::Internal,
            RpcError::Enrollment(e) => e.status(),
        }
    }
}
