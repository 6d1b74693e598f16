//! Command implementations

pub mod delete;
pub mod reconcile;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use canopy_common::graph::{Progress, TaskState};
use canopy_common::store::{create_client, KubeStore};
use canopy_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use canopy_deployer::{Deployer, DesiredState};
use canopy_provider::ProviderRegistry;

use crate::Cli;

pub(crate) fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        format,
        filter: None,
    })?;
    Ok(())
}

/// Loaded document, connected store and a cancellation token wired to Ctrl-C
pub struct Session {
    pub deployer: Deployer,
    pub cancel: CancellationToken,
}

impl Session {
    pub async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = DesiredState::from_file(&cli.file)
            .with_context(|| format!("loading {}", cli.file.display()))?;
        if let Some(path) = &cli.kubeconfig {
            config.kubeconfig = Some(path.clone());
        }

        let client = create_client(config.kubeconfig.as_deref())
            .await
            .context("connecting to the hosting cluster")?;
        let mut deployer = Deployer::new(
            config,
            Arc::new(KubeStore::new(client)),
            ProviderRegistry::new(),
        )?;
        if let Some(parallelism) = cli.parallelism {
            deployer = deployer.with_parallelism(parallelism);
        }

        Ok(Self {
            deployer,
            cancel: cancel_on_interrupt(),
        })
    }
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining tasks");
            token.cancel();
        }
    });
    cancel
}

pub(crate) fn log_progress(progress: &Progress) {
    match progress.state {
        TaskState::Failed => warn!(
            task = %progress.task,
            failed = progress.failed,
            total = progress.total,
            "task failed"
        ),
        TaskState::Running => info!(
            task = %progress.task,
            running = progress.running.len(),
            "task started"
        ),
        state => info!(
            task = %progress.task,
            %state,
            done = progress.completed + progress.failed + progress.not_run,
            total = progress.total,
            "task finished"
        ),
    }
}
