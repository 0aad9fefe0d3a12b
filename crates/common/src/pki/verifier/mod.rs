use std::fmt::Debug;

use async_trait::async_trait;

use crate::crypto::PublicKey;

use super::certificate::Certificate;
use super::chain::Chain;
use super::error::PkiError;

mod fallback;
mod local;
mod nil;
mod upstream;

pub use fallback::FallbackVerifier;
pub use local::LocalVerifier;
pub use nil::NilVerifier;
pub use upstream::UpstreamVerifier;

/// Chain verification contract
///
/// On success both methods return the chain from the leaf up to the
/// trusted root. Any error means "untrusted"; callers never downgrade one
/// to a pass.
#[async_trait]
pub trait Verifier: Send + Sync + Debug + 'static {
    async fn verify(&self, certificate: &Certificate) -> Result<Chain, PkiError>;

    async fn verify_public_key(&self, key: &PublicKey) -> Result<Chain, PkiError>;
}
