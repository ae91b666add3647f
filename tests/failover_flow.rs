//! Scenario tests for failure detection and failover against the in-memory
//! store with canned replication state.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pgcluster_operator::config::OperatorConfig;
use pgcluster_operator::crd::task::failover_task_name;
use pgcluster_operator::events::RecordingPublisher;
use pgcluster_operator::failover::promotion::RecordingPromotion;
use pgcluster_operator::failover::target::best_failover_target;
use pgcluster_operator::failover::{
    CannedReplicationStatus, FailoverDetector, FailoverError, FailoverHandler, RelabelFailover,
    ReplicationInfo, StrategyRegistry,
};
use pgcluster_operator::labels;
use pgcluster_operator::selector::Selector;
use pgcluster_operator::store::{MemoryStore, ResourceStore};

use common::{
    NS, cluster, primary_deployment, primary_pod, replica_deployment, replica_pod,
    replica_record, test_config,
};

fn canned_two_replicas() -> CannedReplicationStatus {
    CannedReplicationStatus::new()
        .with(ReplicationInfo {
            receive_location: 200,
            replay_location: 200,
            node_name: "nodeA".to_string(),
            deployment_name: "r-nodea".to_string(),
        })
        .with(ReplicationInfo {
            receive_location: 250,
            replay_location: 250,
            node_name: "nodeB".to_string(),
            deployment_name: "r-nodeb".to_string(),
        })
}

async fn seed_cluster_with_replicas(store: &MemoryStore, replicas_ready: bool) {
    store.seed_cluster(NS, cluster("pg1")).await;
    store
        .create_deployment(NS, &primary_deployment("pg1"))
        .await
        .unwrap();
    store.seed_pod(NS, primary_pod("pg1", false)).await;

    for (name, node) in [("r-nodea", "nodeA"), ("r-nodeb", "nodeB")] {
        store
            .create_deployment(NS, &replica_deployment("pg1", name))
            .await
            .unwrap();
        store
            .seed_pod(NS, replica_pod("pg1", name, node, replicas_ready))
            .await;
        store
            .create_replica(NS, &replica_record("pg1", name))
            .await
            .unwrap();
    }
}

/// Poll until the failover task shows up, or give up after two seconds.
async fn await_failover_task(store: &MemoryStore) -> Option<pgcluster_operator::PgTask> {
    for _ in 0..200 {
        if let Ok(task) = store.get_task(NS, &failover_task_name("pg1")).await {
            return Some(task);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn detection_selects_higher_receive_location_over_preferred_node() {
    let store = Arc::new(MemoryStore::new());
    seed_cluster_with_replicas(&store, true).await;

    let config = OperatorConfig {
        preferred_failover_node: Some("nodeA".to_string()),
        ..test_config()
    };
    let detector = FailoverDetector::new(
        store.clone(),
        Arc::new(canned_two_replicas()),
        config,
    );

    // register on Ready, then observe the sustained NotReady
    detector.observe(NS, "pg1", true).await;
    detector.observe(NS, "pg1", false).await;

    let task = await_failover_task(&store).await.expect("failover task");
    let target = task
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::TARGET))
        .cloned();

    // r-nodeb has a strictly higher receive location, so the preferred-node
    // setting must not override it
    assert_eq!(target.as_deref(), Some("r-nodeb"));

    // the autofail event log was cleared after triggering
    assert!(store
        .get_task(NS, &pgcluster_operator::crd::task::autofail_task_name("pg1"))
        .await
        .is_err());
}

#[tokio::test]
async fn recovery_during_debounce_cancels_failover() {
    let store = Arc::new(MemoryStore::new());
    seed_cluster_with_replicas(&store, true).await;

    let config = OperatorConfig {
        // long enough for the Ready observation to land mid-debounce
        autofail_sleep_seconds: 1,
        ..test_config()
    };
    let detector = FailoverDetector::new(
        store.clone(),
        Arc::new(canned_two_replicas()),
        config,
    );

    detector.observe(NS, "pg1", true).await;
    detector.observe(NS, "pg1", false).await;
    detector.observe(NS, "pg1", true).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.get_task(NS, &failover_task_name("pg1")).await.is_err());
}

#[tokio::test]
async fn no_ready_replica_aborts_without_touching_primary() {
    let store = Arc::new(MemoryStore::new());
    seed_cluster_with_replicas(&store, false).await;

    // direct selection surfaces the explicit no-target error
    let provider = canned_two_replicas();
    let err = best_failover_target(store.as_ref(), &provider, NS, "pg1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FailoverError::NoTarget(_, _)));

    // and the detection path never creates a failover task
    let detector = FailoverDetector::new(
        store.clone(),
        Arc::new(canned_two_replicas()),
        test_config(),
    );
    detector.observe(NS, "pg1", true).await;
    detector.observe(NS, "pg1", false).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(store.get_task(NS, &failover_task_name("pg1")).await.is_err());
    // the primary deployment is untouched
    assert!(store.get_deployment(NS, "pg1").await.is_ok());
}

#[tokio::test]
async fn full_failover_replaces_primary_and_provisions_replacement() {
    let store = Arc::new(MemoryStore::new());
    seed_cluster_with_replicas(&store, true).await;

    let config = OperatorConfig {
        preferred_failover_node: Some("nodeA".to_string()),
        autofail_replace_replica: true,
        ..test_config()
    };

    // detection
    let detector = FailoverDetector::new(
        store.clone(),
        Arc::new(canned_two_replicas()),
        config.clone(),
    );
    detector.observe(NS, "pg1", true).await;
    detector.observe(NS, "pg1", false).await;
    let task = await_failover_task(&store).await.expect("failover task");

    // execution
    let events = Arc::new(RecordingPublisher::new());
    let promotion = Arc::new(RecordingPromotion::new());
    let strategies = StrategyRegistry::new().register(
        "1",
        Arc::new(RelabelFailover::new(
            store.clone(),
            promotion.clone(),
            events.clone(),
            config.clone(),
        )),
    );
    let handler = FailoverHandler::new(store.clone(), strategies, config);
    handler.run(NS, &task).await.expect("failover run");

    // the old primary deployment was deleted and its pod awaited out
    assert!(store.get_deployment(NS, "pg1").await.is_err());
    assert!(store.get_pod(NS, "pg1-pod").await.is_err());

    // the target instance was promoted
    assert_eq!(promotion.promoted(), vec!["r-nodeb-pod".to_string()]);

    // relabeling is the switchover: pod and deployment now carry the
    // primary service selector
    let pod = store.get_pod(NS, "r-nodeb-pod").await.unwrap();
    assert_eq!(
        pod.metadata.labels.unwrap().get(labels::SERVICE_NAME).map(String::as_str),
        Some("pg1")
    );
    let deployment = store.get_deployment(NS, "r-nodeb").await.unwrap();
    assert_eq!(
        deployment
            .metadata
            .labels
            .unwrap()
            .get(labels::SERVICE_NAME)
            .map(String::as_str),
        Some("pg1")
    );

    // the cluster record tracks the new primary
    let cluster = store.get_cluster(NS, "pg1").await.unwrap();
    assert_eq!(
        cluster
            .metadata
            .labels
            .unwrap()
            .get(labels::CURRENT_PRIMARY)
            .map(String::as_str),
        Some("r-nodeb")
    );

    // the promoted replica's record is gone and exactly one replacement
    // replica was created
    let replicas = store
        .list_replicas(NS, &Selector::new().eq(labels::PG_CLUSTER, "pg1"))
        .await
        .unwrap();
    let names: Vec<String> = replicas.iter().map(|r| r.spec.name.clone()).collect();
    assert!(!names.contains(&"r-nodeb".to_string()));
    assert!(names.contains(&"r-nodea".to_string()));
    let replacements: Vec<&String> =
        names.iter().filter(|n| n.starts_with("pg1-")).collect();
    assert_eq!(replacements.len(), 1);

    // the audit trail recorded the sequence on the task
    let audited = store.get_task(NS, &failover_task_name("pg1")).await.unwrap();
    let message = audited.status.unwrap_or_default().message;
    assert!(message.contains("deleted primary deployment pg1"));
    assert!(message.contains("promoting pod r-nodeb-pod"));
    assert!(message.contains("failover completed"));
}

#[tokio::test]
async fn consuming_last_replica_without_replacement_removes_replica_service() {
    let store = Arc::new(MemoryStore::new());
    store.seed_cluster(NS, cluster("pg1")).await;
    store
        .create_deployment(NS, &primary_deployment("pg1"))
        .await
        .unwrap();
    store.seed_pod(NS, primary_pod("pg1", false)).await;

    // a single replica and its service
    store
        .create_deployment(NS, &replica_deployment("pg1", "r-only"))
        .await
        .unwrap();
    store
        .seed_pod(NS, replica_pod("pg1", "r-only", "nodeA", true))
        .await;
    store
        .create_replica(NS, &replica_record("pg1", "r-only"))
        .await
        .unwrap();
    let replica_service = k8s_openapi::api::core::v1::Service {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("pg1-replica".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    store.create_service(NS, &replica_service).await.unwrap();

    let config = test_config(); // replacement disabled
    let provider = CannedReplicationStatus::new().with(ReplicationInfo {
        receive_location: 100,
        replay_location: 100,
        node_name: "nodeA".to_string(),
        deployment_name: "r-only".to_string(),
    });

    let detector = FailoverDetector::new(store.clone(), Arc::new(provider), config.clone());
    detector.observe(NS, "pg1", true).await;
    detector.observe(NS, "pg1", false).await;
    let task = await_failover_task(&store).await.expect("failover task");

    let events = Arc::new(RecordingPublisher::new());
    let promotion = Arc::new(RecordingPromotion::new());
    let strategies = StrategyRegistry::new().register(
        "1",
        Arc::new(RelabelFailover::new(
            store.clone(),
            promotion,
            events,
            config.clone(),
        )),
    );
    let handler = FailoverHandler::new(store.clone(), strategies, config);
    handler.run(NS, &task).await.expect("failover run");

    // last replica consumed, nothing replaced it: the replica service goes
    assert!(store.get_service(NS, "pg1-replica").await.is_err());
    let replicas = store
        .list_replicas(NS, &Selector::new().eq(labels::PG_CLUSTER, "pg1"))
        .await
        .unwrap();
    assert!(replicas.is_empty());
}

#[tokio::test]
async fn initialize_seeds_state_from_running_pods() {
    let store = Arc::new(MemoryStore::new());
    seed_cluster_with_replicas(&store, true).await;

    let detector = FailoverDetector::new(
        store.clone(),
        Arc::new(canned_two_replicas()),
        test_config(),
    );
    detector.initialize(NS).await.expect("initialize");

    // the primary pod is labeled for autofail and NotReady, so startup
    // seeding registers the cluster and goes straight into a debounce that
    // ends in a failover task
    let task = await_failover_task(&store).await.expect("failover task");
    assert_eq!(
        task.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::PG_CLUSTER))
            .map(String::as_str),
        Some("pg1")
    );
}
