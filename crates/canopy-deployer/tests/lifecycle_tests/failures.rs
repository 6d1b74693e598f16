//! Failure containment

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use tokio_util::sync::CancellationToken;

use canopy_common::graph::TaskState;
use canopy_common::store::get_typed;
use canopy_common::Error;
use canopy_deployer::reconcile::{
    AUTOSCALER_TASK, DATA_STORE_TASK, FRONT_END_SERVICE_TASK, FRONT_END_TASK,
};
use canopy_deployer::DesiredState;
use canopy_provider::ProviderRegistry;

use super::{deployer, document, FailingStore, ProgressLog, NAMESPACE};

/// Story: the front end can't be written; everything that doesn't depend on
/// it still converges and the error names the task and what never ran
#[tokio::test]
async fn story_failed_front_end_leaves_independent_branches_converged() {
    let store = Arc::new(FailingStore::failing(&["Deployment"]));
    let log = ProgressLog::default();
    let callback = log.callback();

    let err = deployer(&document("alpha"), store.clone(), &ProviderRegistry::new())
        .reconcile(&CancellationToken::new(), Some(&callback))
        .await
        .unwrap_err();

    match &err {
        Error::TaskFailed {
            task,
            message,
            not_run,
        } => {
            assert_eq!(task, FRONT_END_TASK);
            assert!(message.contains("connection reset"), "{message}");
            assert_eq!(not_run, &vec![AUTOSCALER_TASK.to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(log.final_state(DATA_STORE_TASK), Some(TaskState::Succeeded));
    assert_eq!(log.final_state(FRONT_END_SERVICE_TASK), Some(TaskState::Succeeded));
    assert_eq!(log.final_state(AUTOSCALER_TASK), Some(TaskState::NotRun));

    let set = get_typed::<StatefulSet>(&store.inner, "alpha-data-store-events", Some(NAMESPACE))
        .await
        .unwrap();
    assert!(set.is_some());
}

/// A data store failure stops the front end but not its load balancer
#[tokio::test]
async fn data_store_failure_blocks_only_its_dependents() {
    let store = Arc::new(FailingStore::failing(&["StatefulSet"]));

    let err = deployer(&document("alpha"), store.clone(), &ProviderRegistry::new())
        .reconcile(&CancellationToken::new(), None)
        .await
        .unwrap_err();

    let Error::TaskFailed { task, not_run, .. } = err else {
        panic!("expected a task failure");
    };
    assert_eq!(task, DATA_STORE_TASK);
    assert!(not_run.contains(&FRONT_END_TASK.to_string()));
    assert!(not_run.contains(&AUTOSCALER_TASK.to_string()));

    let service = get_typed::<Service>(&store.inner, "alpha-front-end", Some(NAMESPACE))
        .await
        .unwrap();
    assert!(service.is_some());
}

/// Invalid documents are rejected before anything is written
#[tokio::test]
async fn invalid_document_fails_before_any_write() {
    let config = DesiredState::from_yaml(
        "namespace: tenants\ninstanceName: alpha\ninfrastructureProvider: vendor-x\n",
    )
    .unwrap();
    let store = Arc::new(FailingStore::failing(&[]));
    let result = canopy_deployer::Deployer::new(config, store.clone(), ProviderRegistry::new());

    assert!(matches!(result, Err(Error::UnsupportedProvider { .. })));
    assert_eq!(store.inner.writes(), 0);
}

/// Missing vendor credential keys surface at startup, not mid-graph
#[tokio::test]
async fn incomplete_backup_credentials_fail_before_any_write() {
    let yaml = format!(
        r#"{}credentials:
  s3:
    provider: aws
    data:
      accessKeyID: AKIAEXAMPLE
dataStore:
  backup:
    enabled: true
    provider: aws
    credentialsRef: s3
    bucketName: alpha-backups
    region: us-east-1
"#,
        document("alpha")
    );
    let config = DesiredState::from_yaml(&yaml).unwrap();
    let store = Arc::new(FailingStore::failing(&[]));
    let result = canopy_deployer::Deployer::new(config, store.clone(), ProviderRegistry::new());

    assert!(matches!(result, Err(Error::Validation { .. })));
    assert_eq!(store.inner.writes(), 0);
}

/// Story: the operator interrupts while the first data store cluster is being
/// written; nothing further is written and the run reports the interruption
#[tokio::test]
async fn story_cancellation_stops_writes_mid_task() {
    let cancel = CancellationToken::new();
    let store = Arc::new(FailingStore::cancelling_on("StatefulSet", cancel.clone()));
    let log = ProgressLog::default();
    let callback = log.callback();

    let err = deployer(&document("alpha"), store.clone(), &ProviderRegistry::new())
        .reconcile(&cancel, Some(&callback))
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::TaskFailed { .. } | Error::Cancelled { .. }),
        "{err}"
    );
    assert!(err.to_string().contains("cancelled"), "{err}");
    assert_ne!(log.final_state(DATA_STORE_TASK), Some(TaskState::Succeeded));
    assert_eq!(log.final_state(AUTOSCALER_TASK), Some(TaskState::NotRun));

    let events = get_typed::<StatefulSet>(&store.inner, "alpha-data-store-events", Some(NAMESPACE))
        .await
        .unwrap();
    assert!(events.is_none());
    let front_end = get_typed::<Deployment>(&store.inner, "alpha-front-end", Some(NAMESPACE))
        .await
        .unwrap();
    assert!(front_end.is_none());
}
