//! Reconcile task graph
//!
//! One task per logical component. Every task body has the same shape: it
//! receives the shared [`DeployContext`], the [`ExportsCollector`] and the
//! cancellation token, converges its objects through
//! [`ensure_desired_state`](canopy_common::reconcile::ensure_desired_state)
//! and records the exports it owns.
//!
//! ```text
//! namespace ──┬── backup-bucket ──┐
//!             │                   ├── data-store ──┐
//! storage-class ──────────────────┘                ├── front-end ── autoscaler
//!             └── front-end-service ───────────────┘
//! ```

pub mod autoscaler;
pub mod backup;
pub mod data_store;
pub mod front_end;
pub mod front_end_service;
pub mod namespace;
pub mod storage_class;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use canopy_common::graph::{Task, TaskGraph, TaskGraphBuilder};
use canopy_common::{Error, Result};

use crate::context::DeployContext;
use crate::exports::ExportsCollector;

/// Creates the instance namespace
pub const NAMESPACE_TASK: &str = "deploy-namespace";
/// Creates the data store storage class
pub const STORAGE_CLASS_TASK: &str = "deploy-storage-class";
/// Creates the backup bucket
pub const BACKUP_BUCKET_TASK: &str = "deploy-backup-bucket";
/// Exposes the front end and waits for its address
pub const FRONT_END_SERVICE_TASK: &str = "deploy-front-end-service";
/// Deploys both data store clusters
pub const DATA_STORE_TASK: &str = "deploy-data-store";
/// Deploys the front end
pub const FRONT_END_TASK: &str = "deploy-front-end";
/// Creates or removes the front end autoscaler
pub const AUTOSCALER_TASK: &str = "deploy-front-end-autoscaler";

/// Wrap a task body so each attempt gets its own handles to the shared state
///
/// The body is dropped as soon as the task's token is cancelled, abandoning
/// whatever remote call it was waiting on.
pub(crate) fn deploy_task<F, Fut>(
    id: &str,
    ctx: &Arc<DeployContext>,
    exports: &Arc<ExportsCollector>,
    body: F,
) -> Task
where
    F: Fn(Arc<DeployContext>, Arc<ExportsCollector>, CancellationToken) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    let exports = exports.clone();
    let task_id = id.to_string();
    Task::new(id, move |cancel: CancellationToken| {
        let run = body(ctx.clone(), exports.clone(), cancel.clone());
        let task_id = task_id.clone();
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::cancelled(format!("task {task_id}"))),
                result = run => result,
            }
        }
    })
}

/// Stop between remote writes once cancellation is requested
pub(crate) fn checkpoint(cancel: &CancellationToken, step: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(step.to_string()));
    }
    Ok(())
}

/// Compile the reconcile graph for one instance
pub fn build_reconcile_graph(
    ctx: Arc<DeployContext>,
    exports: Arc<ExportsCollector>,
) -> Result<TaskGraph> {
    let backup_enabled = ctx.config().backup_enabled();

    let graph = TaskGraphBuilder::new()
        .task(deploy_task(NAMESPACE_TASK, &ctx, &exports, namespace::run))
        .task(deploy_task(STORAGE_CLASS_TASK, &ctx, &exports, storage_class::run))
        .task(
            deploy_task(BACKUP_BUCKET_TASK, &ctx, &exports, backup::run)
                .depends_on([NAMESPACE_TASK])
                .skip_if(move || !backup_enabled),
        )
        .task(
            deploy_task(FRONT_END_SERVICE_TASK, &ctx, &exports, front_end_service::run)
                .depends_on([NAMESPACE_TASK]),
        )
        .task(
            deploy_task(DATA_STORE_TASK, &ctx, &exports, data_store::run).depends_on([
                NAMESPACE_TASK,
                STORAGE_CLASS_TASK,
                BACKUP_BUCKET_TASK,
            ]),
        )
        .task(
            deploy_task(FRONT_END_TASK, &ctx, &exports, front_end::run)
                .depends_on([DATA_STORE_TASK, FRONT_END_SERVICE_TASK]),
        )
        .task(
            deploy_task(AUTOSCALER_TASK, &ctx, &exports, autoscaler::run)
                .depends_on([FRONT_END_TASK]),
        )
        .build()?;
    Ok(graph)
}

/// Add `desired` to `labels`, keeping labels set by others
pub(crate) fn merge_labels(
    labels: &mut Option<BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) {
    let labels = labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in desired {
        labels.insert(k.clone(), v.clone());
    }
}
