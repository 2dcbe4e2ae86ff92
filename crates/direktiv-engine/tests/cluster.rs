mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{eventually, test_config, Cluster, RecordingInvoker, NAMESPACE, WAIT};
use direktiv_core::config::EngineConfig;
use direktiv_core::catalog::RouteRecord;
use direktiv_core::error::codes;
use direktiv_core::instance::{ActionResultPayload, InstanceStatus};
use direktiv_core::timer::names;
use direktiv_engine::{Engine, InstanceStore, NewInstanceArgs};

const CALL: &str = r#"
functions:
  - id: work
    type: reusable
    image: direktiv/work
states:
  - id: call
    type: action
    action:
      function: work
"#;

async fn start(engine: &Engine, path: &str) -> uuid::Uuid {
    engine
        .submit(NewInstanceArgs {
            namespace: NAMESPACE.into(),
            path: path.into(),
            input: json!({}),
            invoker: "test".into(),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn respond(engine: &Engine, instance_id: uuid::Uuid, action_id: &str, output: Value) {
    engine
        .report_action_result(
            instance_id,
            ActionResultPayload {
                action_id: action_id.to_string(),
                output,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_are_routed_to_the_controller() {
    let cluster = Cluster::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let a = cluster.replica("replica-a", invoker.clone()).await;
    let b = cluster.replica("replica-b", invoker.clone()).await;
    let ns = cluster.store.create_namespace(NAMESPACE).await.unwrap();
    cluster.store.put_workflow(ns.id, "/call.yaml", CALL).await.unwrap();

    let id = start(&a, "/call.yaml").await;
    let request = invoker.wait_for_requests(1).await.remove(0);
    let runtime = cluster.store.get_runtime(id).await.unwrap().unwrap();
    assert_eq!(runtime.controller, "replica-a");

    respond(&b, id, &request.action_id, json!("via b")).await;

    let instance = b.wait_for_instance(id, WAIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output.unwrap()["return"], json!("via b"));
    let runtime = cluster.store.get_runtime(id).await.unwrap().unwrap();
    assert_eq!(runtime.controller, "replica-a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departing_replica_hands_over_instances() {
    let cluster = Cluster::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let a = cluster.replica("replica-a", invoker.clone()).await;
    let b = cluster.replica("replica-b", invoker.clone()).await;
    let ns = cluster.store.create_namespace(NAMESPACE).await.unwrap();
    cluster.store.put_workflow(ns.id, "/call.yaml", CALL).await.unwrap();

    let id = start(&a, "/call.yaml").await;
    let request = invoker.wait_for_requests(1).await.remove(0);

    a.shutdown().await;
    eventually("adoption by replica-b", || async {
        let runtime = cluster.store.get_runtime(id).await.unwrap()?;
        (runtime.controller == "replica-b").then_some(())
    })
    .await;

    respond(&b, id, &request.action_id, json!("adopted")).await;
    let instance = b.wait_for_instance(id, WAIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output.unwrap()["return"], json!("adopted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_through_other_replica_clears_timers() {
    let cluster = Cluster::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let a = cluster.replica("replica-a", invoker.clone()).await;
    let b = cluster.replica("replica-b", invoker.clone()).await;
    let ns = cluster.store.create_namespace(NAMESPACE).await.unwrap();
    cluster
        .store
        .put_workflow(
            ns.id,
            "/nap.yaml",
            "states:\n  - id: nap\n    type: delay\n    duration: PT1H\n",
        )
        .await
        .unwrap();

    let id = start(&a, "/nap.yaml").await;
    let owned_by_a = || {
        a.timers()
            .list()
            .iter()
            .filter(|t| names::instance_of(&t.name) == Some(id))
            .count()
    };
    eventually("sleep timer on replica-a", || async {
        (owned_by_a() >= 4).then_some(())
    })
    .await;

    b.cancel_instance(id).await.unwrap();
    let instance = b.wait_for_instance(id, WAIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error_code.as_deref(), Some(codes::CANCELLED_API));

    eventually("timers cleared on replica-a", || async {
        (owned_by_a() == 0).then_some(())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_route_changes_reach_every_replica() {
    let cluster = Cluster::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let a = cluster.replica("replica-a", invoker.clone()).await;
    let b = cluster.replica("replica-b", invoker.clone()).await;
    let ns = cluster.store.create_namespace(NAMESPACE).await.unwrap();

    let v1 = cluster
        .store
        .put_workflow(
            ns.id,
            "/routed.yaml",
            "states:\n  - id: a\n    type: noop\n    transform:\n      version: 1\n",
        )
        .await
        .unwrap();
    cluster
        .store
        .put_workflow(
            ns.id,
            "/routed.yaml",
            "states:\n  - id: a\n    type: noop\n    transform:\n      version: 2\n",
        )
        .await
        .unwrap();
    let workflow = cluster
        .store
        .get_workflow(ns.id, "/routed.yaml")
        .await
        .unwrap()
        .unwrap();
    cluster.store.set_ref(workflow.id, "v1", v1.id).await.unwrap();

    // Warm b's route cache with the unrouted default.
    let id = start(&b, "/routed.yaml").await;
    let first = b.wait_for_instance(id, WAIT).await.unwrap();
    assert_eq!(first.output, Some(json!({"version": 2})));

    a.set_routes(
        workflow.id,
        vec![
            RouteRecord {
                workflow_id: workflow.id,
                ref_name: "v1".into(),
                weight: 1,
            },
            RouteRecord {
                workflow_id: workflow.id,
                ref_name: "latest".into(),
                weight: 0,
            },
        ],
    )
    .await
    .unwrap();

    eventually("route reload on replica-b", || async {
        let id = start(&b, "/routed.yaml").await;
        let instance = b.wait_for_instance(id, WAIT).await.unwrap();
        (instance.output == Some(json!({"version": 1}))).then_some(instance)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_starts_instance_that_never_ran() {
    let cluster = Cluster::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let config = EngineConfig {
        ownership_timeout_secs: 1,
        stalled_scan_cron: "* * * * * *".into(),
        ..test_config()
    };
    let a = cluster
        .replica_with_config("replica-a", invoker.clone(), config)
        .await;
    let ns = cluster.store.create_namespace(NAMESPACE).await.unwrap();
    cluster
        .store
        .put_workflow(
            ns.id,
            "/late.yaml",
            "states:\n  - id: a\n    type: noop\n    transform:\n      started: true\n",
        )
        .await
        .unwrap();

    // Created but never started, as when a replica dies right after the insert.
    let im = a
        .new_instance(NewInstanceArgs {
            namespace: NAMESPACE.into(),
            path: "/late.yaml".into(),
            input: json!({}),
            invoker: "test".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = im.id();
    drop(im);

    let runtime = cluster.store.get_runtime(id).await.unwrap().unwrap();
    assert!(runtime.flow.is_empty());

    let instance = a.wait_for_instance(id, WAIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output, Some(json!({"started": true})));
}
