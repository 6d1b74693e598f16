//! `canopy delete`

use tracing::info;

use canopy_common::graph::ProgressFn;

use super::{log_progress, Session};

pub async fn run(session: Session) -> anyhow::Result<()> {
    let progress: &ProgressFn = &log_progress;
    session
        .deployer
        .delete(&session.cancel, Some(progress))
        .await?;
    info!(
        instance = %session.deployer.context().names().instance(),
        "instance deleted"
    );
    Ok(())
}
