//! Self-issued PKI trust model
//!
//! - **Certificates**: X.509 with a role tag (`root|user|server|agent`),
//!   issued by root and user credentials ([`authority`]).
//! - **Chains**: leaf to root, always ending at the locally pinned root.
//! - **Signed envelopes/artifacts**: signatures over arbitrary payloads,
//!   with timestamp + nonce freshness for artifacts.
//! - **Revocation**: a payload-hash ledger consulted for every chain member.
//! - **Verifiers**: local, upstream-delegating, pinned fallback and nil
//!   strategies behind one [`Verifier`] contract.

pub mod authority;
mod certificate;
mod chain;
mod credentials;
mod error;
mod nonce;
mod registry;
mod revocation;
mod signed;
mod verifier;

pub use certificate::{Certificate, CertificateError, CertificateType, CERTIFICATE_TAG};
pub use chain::{build_chain, Chain};
pub use credentials::{Credentials, Lifecycle, CERTIFICATE_FILE, KEY_FILE};
pub use error::PkiError;
pub use nonce::NonceStore;
pub use registry::CertificateRegistry;
pub use revocation::{HashAlgorithm, RevocationRecord, RevocationStore};
pub use signed::{SignedArtifact, SignedEnvelope, NONCE_SIZE};
pub use verifier::{FallbackVerifier, LocalVerifier, NilVerifier, UpstreamVerifier, Verifier};
