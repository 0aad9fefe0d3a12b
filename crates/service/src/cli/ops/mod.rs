mod authority;
mod init;
mod login;
mod operator;
mod run;
mod version;

pub use authority::{Authority, Setup};
pub use init::Init;
pub use login::Login;
pub use operator::{Enrollments, Ping, Revoke};
pub use run::Run;
pub use version::Version;
