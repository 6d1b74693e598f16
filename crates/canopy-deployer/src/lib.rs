//! Orchestration for Canopy managed instances
//!
//! A [`Deployer`] converges one instance described by a
//! [`DesiredState`](config::DesiredState) document, or tears it down:
//!
//! - [`reconcile`]: the deploy task graph and its task bodies
//! - [`delete`]: the teardown task graph
//! - [`secrets`]: generated secrets and config maps
//! - [`exports`]: values handed to downstream consumers
//!
//! Both operations run through the bounded-parallelism executor from
//! `canopy-common` and stop at the first failing branch, leaving independent
//! branches to finish.

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod delete;
pub mod exports;
pub mod names;
pub mod reconcile;
pub mod secrets;
pub mod templates;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use canopy_common::graph::{Executor, ProgressFn};
use canopy_common::store::ResourceStore;
use canopy_common::Result;
use canopy_provider::ProviderRegistry;

pub use config::DesiredState;
pub use context::DeployContext;
pub use exports::{ExportKey, Exports, ExportsCollector};

/// Runs reconcile and delete for one instance
pub struct Deployer {
    context: Arc<DeployContext>,
    executor: Executor,
}

impl Deployer {
    /// Validate `config` and prepare a deployer over `store`
    pub fn new(
        config: DesiredState,
        store: Arc<dyn ResourceStore>,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        Ok(Self {
            context: Arc::new(DeployContext::new(config, store, registry)?),
            executor: Executor::new(),
        })
    }

    /// Run at most `parallelism` tasks at once
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.executor = Executor::with_parallelism(parallelism);
        self
    }

    /// The startup context
    pub fn context(&self) -> &DeployContext {
        &self.context
    }

    /// Converge the instance and return its exports
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> Result<Exports> {
        let exports = Arc::new(ExportsCollector::new());
        let graph = reconcile::build_reconcile_graph(self.context.clone(), exports.clone())?;

        info!(
            instance = %self.context.names().instance(),
            namespace = %self.context.namespace(),
            "reconciling"
        );
        self.executor
            .run(graph, cancel, progress)
            .await
            .into_result()?;
        exports.finalize()
    }

    /// Tear the instance down
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let graph = delete::build_delete_graph(self.context.clone())?;

        info!(
            instance = %self.context.names().instance(),
            namespace = %self.context.namespace(),
            "deleting"
        );
        self.executor
            .run(graph, cancel, progress)
            .await
            .into_result()
    }
}
