//! Node runtime for the RMM platform.
//!
//! This crate turns the trust core and RPC fabric in `common` into running
//! nodes:
//! - Configuration and the on-disk data directory
//! - Logging and process plumbing (signals, panic hook)
//! - The server, agent and operator client roles over iroh

pub mod config;
pub mod logging;
pub mod node;
pub mod process;
pub mod state;

pub use config::{ConfigError, NodeConfig, Role, UpstreamConfig};
pub use node::{Agent, Client, NodeError, Server};
pub use state::{NodeState, StateError};
