/**
 * Wall-clock helpers shared by freshness checks.
 */
pub mod clock;
/**
 * Cryptographic types and operations.
 *  - P-384 signing keys and their encrypted-at-rest form
 *  - Argon2 key derivation for passwords and shared secrets
 *  - CFB stream cipher wrapper for end-to-end encrypted sessions
 */
pub mod crypto;
/**
 * In-flight device registrations waiting on an operator.
 */
pub mod enrollment;
/**
 * Host configuration artifacts and their last-writer-wins store.
 */
pub mod host_config;
/**
 * Username/password login records kept by the server.
 */
pub mod login;
/**
 * Trust model: certificates, credentials, signed envelopes,
 *  nonces, revocation and chain verification.
 */
pub mod pki;
/**
 * Keyed maps that publish upsert/remove events to subscribers.
 */
pub mod pubsub;
/**
 * Multiplexed, relayable RPC: connections, sessions, framing,
 *  command dispatch and the built-in command set.
 */
pub mod rpc;
/**
 * Scoped transactional key-value store used by the trust core.
 */
pub mod store;
/**
 * Fixtures for building a small deployment in tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::pki::{
        Certificate, CertificateType, Chain, Credentials, PkiError, SignedArtifact, Verifier,
    };
    pub use crate::rpc::{Command, Connection, RpcError, Session, Status};
    pub use crate::store::Store;
}
