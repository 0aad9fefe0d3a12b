use tokio::io::AsyncWriteExt;

use super::error::RpcError;
use super::transport::BoxStream;

/// Bytes moved in each direction by [`splice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes both ways until both directions finish
///
/// End of stream on one side half-closes the other. An I/O error in
/// either direction ends both and is returned.
pub async fn splice(mut a: BoxStream, mut b: BoxStream) -> Result<SpliceStats, RpcError> {
    let result = tokio::io::copy_bidirectional(&mut a, &mut b).await;
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    let (a_to_b, b_to_a) = result?;
    tracing::trace!(a_to_b, b_to_a, "splice finished");
    Ok(SpliceStats { a_to_b, b_to_a })
}
