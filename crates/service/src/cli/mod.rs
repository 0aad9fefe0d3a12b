pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Authority, Enrollments, Init, Login, Ping, Revoke, Run, Setup, Version};
