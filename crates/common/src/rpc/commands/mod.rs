//! Built-in command set and the collections each listener serves
//!
//! A listener only decodes the commands in its collection, so what a peer
//! can ask for is fixed by which protocol it connected on.

pub mod e2e;
pub mod enroll;
pub mod forward;
pub mod host_config;
pub mod login;
pub mod ping;
pub mod revoke;
pub mod setup;
pub mod tcp_forward;
pub mod verify_key;

pub use e2e::E2e;
pub use enroll::{AcceptEnrollment, Enroll, EnrollRequest, ListEnrollments};
pub use forward::{open_relayed, Forward};
pub use host_config::{PublishHostConfig, SyncEvent, SyncHostConfigs};
pub use login::{Login, LoginResult};
pub use ping::Ping;
pub use revoke::Revoke;
pub use setup::{Setup, SetupOutcome, SetupRequest, SetupState};
pub use tcp_forward::TcpForward;
pub use verify_key::VerifyKey;

use super::command::CommandCollection;

/// Authenticated protocol on a server
pub fn server_commands() -> CommandCollection {
    CommandCollection::new()
        .register::<Ping>()
        .register::<VerifyKey>()
        .register::<E2e>()
        .register::<Forward>()
        .register::<ListEnrollments>()
        .register::<AcceptEnrollment>()
        .register::<Revoke>()
        .register::<PublishHostConfig>()
        .register::<SyncHostConfigs>()
}

/// Authenticated protocol on an agent, reached through the server relay
pub fn agent_commands() -> CommandCollection {
    CommandCollection::new()
        .register::<Ping>()
        .register::<E2e>()
        .register::<TcpForward>()
}

/// Bootstrap protocol on a server that has not been set up
pub fn setup_commands() -> CommandCollection {
    CommandCollection::new().register::<Setup>()
}

pub fn login_commands() -> CommandCollection {
    CommandCollection::new().register::<Login>()
}

pub fn enroll_commands() -> CommandCollection {
    CommandCollection::new().register::<Enroll>()
}
