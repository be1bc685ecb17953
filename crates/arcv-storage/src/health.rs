//! Storage health check

use anyhow::Result;
use opendal::Operator;

/// Verify the store is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("archive store health check failed: {e}"))
}
