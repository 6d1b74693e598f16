//! Backup bucket

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use canopy_common::Result;

use crate::context::DeployContext;
use crate::exports::ExportsCollector;

/// Create the backup bucket; existing buckets we own are left alone
pub async fn run(
    ctx: Arc<DeployContext>,
    _exports: Arc<ExportsCollector>,
    _cancel: CancellationToken,
) -> Result<()> {
    let Some(provider) = ctx.backup_provider()? else {
        debug!("backup disabled, no bucket to create");
        return Ok(());
    };
    provider.create_bucket().await
}
