//! Multiplexed command RPC over QUIC
//!
//! A [`Connection`] wraps one transport link and hands out independent
//! [`Session`]s. Each session carries one request header, one response
//! header and then whatever frames the command exchanges. A session can
//! be encrypted end to end ([`commands::e2e`]) or spliced onto a session
//! of another connection ([`commands::forward`]), which is how operators
//! reach agents through the server.

mod command;
pub mod commands;
mod connection;
mod context;
mod dispatch;
mod error;
pub mod handshake;
pub mod header;
mod listener;
mod pool;
mod rewind;
mod session;
mod splice;
pub mod transport;

pub use command::{ClientCall, Command, CommandCollection, Outcome};
pub use connection::{Connection, ConnectionState, PeerIdentity};
pub use context::{Capabilities, Context, DEFAULT_EXPIRATION};
pub use error::{pki_status, RpcError, Status};
pub use header::{RequestHeader, ResponseHeader};
pub use listener::{Listener, ENROLL_ALPN, LOGIN_ALPN, RPC_ALPN, SETUP_ALPN};
pub use pool::{ConnectionPool, Dialer};
pub use session::{Session, SessionState};
pub use splice::{splice, SpliceStats};
