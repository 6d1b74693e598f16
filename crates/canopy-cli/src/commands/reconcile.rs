//! `canopy reconcile`

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use canopy_common::graph::ProgressFn;

use super::{log_progress, Session};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Write exports here instead of stdout
    #[arg(long)]
    pub exports: Option<PathBuf>,
}

pub async fn run(session: Session, args: ReconcileArgs) -> anyhow::Result<()> {
    let progress: &ProgressFn = &log_progress;
    let exports = session
        .deployer
        .reconcile(&session.cancel, Some(progress))
        .await?;
    let yaml = exports.to_yaml()?;

    match args.exports {
        Some(path) => {
            std::fs::write(&path, yaml)
                .with_context(|| format!("writing exports to {}", path.display()))?;
            info!(path = %path.display(), "exports written");
        }
        None => print!("{yaml}"),
    }
    Ok(())
}
