//! Cluster tests
//!
//! Real managers with running gossip, inbound and persistence tasks, wired
//! together over a [`LocalBus`].

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::watch;
use tracing as log;

use super::test_utils::{
    init_test_logging, map, test_config, wait_until, FailingPersistence, TestCluster,
};
use crate::{
    clock::NodeId,
    config::ContextMeshConfig,
    error::ContextError,
    manager::ContextManager,
    message::{ContextUpdate, CONTEXT_TOPIC},
    persistence::{ContextPersistence, MemoryContextPersistence, NoOpContextPersistence},
    transport::{Frame, LocalBus, Transport},
    ContextMap,
};

const CONVERGE: Duration = Duration::from_secs(3);

async fn converged(cluster: &TestCluster, context_id: &str, expected: &ContextMap) -> bool {
    wait_until(CONVERGE, || {
        cluster
            .nodes
            .iter()
            .all(|node| &node.manager.get_context(context_id) == expected)
    })
    .await
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_two_nodes_merge_disjoint_fields() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2"], test_config());

    cluster
        .node(0)
        .merge_context("session:42", json!({"topic": "billing"}), None)
        .await
        .unwrap();
    cluster
        .node(1)
        .merge_context("session:42", json!({"urgency": "high"}), None)
        .await
        .unwrap();

    let expected = map(json!({"topic": "billing", "urgency": "high"}));
    assert!(converged(&cluster, "session:42", &expected).await);

    let clock_1 = cluster.node(0).vector_clock();
    assert!(clock_1.get(&NodeId::from("n1")) >= 1);
    assert!(clock_1.get(&NodeId::from("n2")) >= 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_three_nodes_converge_on_many_contexts() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2", "n3"], test_config());

    for i in 0..10 {
        let writer = cluster.node(i % 3);
        writer
            .merge_context(
                &format!("agent:{}", i),
                json!({"load": i, "role": if i % 2 == 0 { "system1" } else { "system3" }}),
                None,
            )
            .await
            .unwrap();
    }

    let all_listed = wait_until(CONVERGE, || {
        cluster
            .nodes
            .iter()
            .all(|node| node.manager.list_contexts(&ContextMap::new()).len() == 10)
    })
    .await;
    assert!(all_listed);

    let filter = map(json!({"role": "system1"}));
    for node in &cluster.nodes {
        let listed = node.manager.list_contexts(&filter);
        assert_eq!(listed.len(), 5);
        assert!(listed.values().all(|ctx| ctx.get("role") == Some(&json!("system1"))));
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_concurrent_writes_to_same_field_agree() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2", "n3"], test_config());

    for (i, node) in cluster.nodes.iter().enumerate() {
        node.manager
            .merge_context("shared", json!({"owner": format!("node-{}", i)}), None)
            .await
            .unwrap();
    }

    let agreed = wait_until(CONVERGE, || {
        let first = cluster.node(0).get_context("shared");
        cluster
            .nodes
            .iter()
            .all(|node| node.manager.get_context("shared") == first)
    })
    .await;
    assert!(agreed);
    assert!(cluster.node(0).get_context("shared").contains_key("owner"));

    cluster.stop().await;
}

#[tokio::test]
async fn test_partitioned_node_catches_up_after_heal() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2", "n3"], test_config());
    let isolated = NodeId::from("n3");

    cluster.bus.set_reachable(&isolated, false);
    cluster
        .node(0)
        .merge_context("incident:7", json!({"severity": "critical"}), None)
        .await
        .unwrap();
    cluster
        .node(2)
        .merge_context("incident:7", json!({"assignee": "system5"}), None)
        .await
        .unwrap();

    // The majority side converges without n3's write
    let majority = wait_until(CONVERGE, || {
        cluster.node(1).get_context("incident:7") == map(json!({"severity": "critical"}))
    })
    .await;
    assert!(majority);
    assert!(cluster.node(2).get_context("incident:7").get("severity").is_none());

    cluster.bus.set_reachable(&isolated, true);
    let expected = map(json!({"severity": "critical", "assignee": "system5"}));
    assert!(converged(&cluster, "incident:7", &expected).await);

    cluster.stop().await;
}

#[tokio::test]
async fn test_removal_propagates_and_tombstones_compact() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2"], test_config());

    cluster
        .node(0)
        .merge_context("ctx", json!({"keep": 1, "drop": 2}), None)
        .await
        .unwrap();
    assert!(converged(&cluster, "ctx", &map(json!({"keep": 1, "drop": 2}))).await);

    let after = cluster.node(1).remove("ctx", &["drop"]).await;
    assert_eq!(after, map(json!({"keep": 1})));
    assert!(converged(&cluster, "ctx", &map(json!({"keep": 1}))).await);

    let compacted = wait_until(CONVERGE, || {
        cluster
            .nodes
            .iter()
            .all(|node| node.manager.metrics().tombstones_compacted > 0)
    })
    .await;
    assert!(compacted);

    // Compaction never brings the removed field back
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &cluster.nodes {
        assert_eq!(node.manager.get_context("ctx"), map(json!({"keep": 1})));
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_partitioned_peer_keeps_removal_from_resurrecting() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2", "n3"], test_config());
    let isolated = NodeId::from("n3");

    cluster
        .node(0)
        .merge_context("ctx", json!({"keep": 1, "drop": 2}), None)
        .await
        .unwrap();
    assert!(converged(&cluster, "ctx", &map(json!({"keep": 1, "drop": 2}))).await);
    // Let every node see every other one live and report a clock
    tokio::time::sleep(Duration::from_millis(200)).await;

    cluster.bus.set_reachable(&isolated, false);
    cluster.node(0).remove("ctx", &["drop"]).await;
    let majority = wait_until(CONVERGE, || {
        cluster.node(1).get_context("ctx") == map(json!({"keep": 1}))
    })
    .await;
    assert!(majority);

    // n3 still holds the addition, so the tombstone must stay
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.node(0).metrics().tombstones_compacted, 0);
    assert_eq!(cluster.node(1).metrics().tombstones_compacted, 0);

    cluster.bus.set_reachable(&isolated, true);
    assert!(converged(&cluster, "ctx", &map(json!({"keep": 1}))).await);

    let compacted = wait_until(CONVERGE, || {
        cluster
            .nodes
            .iter()
            .all(|node| node.manager.metrics().tombstones_compacted > 0)
    })
    .await;
    assert!(compacted);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &cluster.nodes {
        assert_eq!(node.manager.get_context("ctx"), map(json!({"keep": 1})));
    }

    cluster.stop().await;
}

// ============================================================================
// Notifications and Persistence
// ============================================================================

#[tokio::test]
async fn test_subscribers_see_local_and_remote_updates() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2"], test_config());
    let mut local = cluster.node(0).subscribe();
    let mut remote = cluster.node(1).subscribe();

    cluster
        .node(0)
        .merge_context("session:1", json!({"topic": "onboarding"}), None)
        .await
        .unwrap();

    let update = tokio::time::timeout(CONVERGE, local.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.context_id, "session:1");
    assert_eq!(update.origin_node, NodeId::from("n1"));

    let update = tokio::time::timeout(CONVERGE, remote.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.context_id, "session:1");
    assert_eq!(update.context, map(json!({"topic": "onboarding"})));
    assert_eq!(update.origin_node, NodeId::from("n1"));

    cluster.stop().await;
}

#[tokio::test]
async fn test_changes_are_persisted_on_every_node() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2"], test_config());

    cluster
        .node(0)
        .merge_context("session:9", json!({"topic": "refund"}), None)
        .await
        .unwrap();

    let persisted = wait_until(CONVERGE, || {
        cluster.nodes.iter().all(|node| {
            node.persistence
                .get("session:9")
                .is_some_and(|record| record.context == map(json!({"topic": "refund"})))
        })
    })
    .await;
    assert!(persisted);
    assert!(cluster.node(0).metrics().persistence_writes >= 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_recover_replays_persisted_contexts() {
    init_test_logging();
    let persistence = Arc::new(MemoryContextPersistence::new());
    let bus = LocalBus::new();
    let (shutdown, signal) = watch::channel(());

    let first = ContextManager::new(
        test_config(),
        Arc::new(bus.join(NodeId::from("n1"))),
        persistence.clone() as Arc<dyn ContextPersistence>,
    )
    .unwrap();
    let handles = first.start(signal).unwrap();
    first
        .merge_context("session:5", json!({"topic": "billing"}), None)
        .await
        .unwrap();
    first
        .merge_context("session:5", json!({"urgency": "low"}), None)
        .await
        .unwrap();
    let _ = shutdown.send(());
    for handle in handles {
        handle.await.unwrap();
    }
    bus.leave(&NodeId::from("n1"));

    let restarted = ContextManager::new(
        test_config(),
        Arc::new(bus.join(NodeId::from("n1"))),
        persistence.clone() as Arc<dyn ContextPersistence>,
    )
    .unwrap();
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert_eq!(
        restarted.get_context("session:5"),
        map(json!({"topic": "billing", "urgency": "low"}))
    );
    // Replay is not a new change
    assert_eq!(restarted.metrics().notifications, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_record_and_notification_match_final_state() {
    init_test_logging();
    let config = ContextMeshConfig {
        notification_capacity: 4096,
        ..test_config()
    };
    let cluster = TestCluster::start(&["n1", "n2"], config);
    let mut subscribers: Vec<_> = cluster.nodes.iter().map(|n| n.manager.subscribe()).collect();

    let writers: Vec<_> = cluster
        .nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let manager = node.manager.clone();
            tokio::spawn(async move {
                for round in 0..50 {
                    manager
                        .merge_context("hot", json!({ format!("w{}", index): round }), None)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let expected = map(json!({"w0": 49, "w1": 49}));
    assert!(converged(&cluster, "hot", &expected).await);

    for (node, subscriber) in cluster.nodes.iter().zip(subscribers.iter_mut()) {
        let persisted = wait_until(CONVERGE, || {
            node.persistence
                .get("hot")
                .is_some_and(|record| record.context == expected)
        })
        .await;
        assert!(persisted, "last persisted record is stale on {}", node.manager.node_id());

        let mut last: Option<ContextUpdate> = None;
        loop {
            match subscriber.try_recv() {
                Ok(update) => last = Some(update),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(last.map(|update| update.context), Some(expected.clone()));
    }

    cluster.stop().await;
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1"], test_config());
    let stranger = cluster.bus.join(NodeId::from("stranger"));

    stranger
        .send(&NodeId::from("n1"), Frame::new(CONTEXT_TOPIC, b"{not json".to_vec()))
        .await
        .unwrap();
    stranger
        .send(&NodeId::from("n1"), Frame::new("other.topic", b"ignored".to_vec()))
        .await
        .unwrap();

    let counted = wait_until(CONVERGE, || {
        cluster.node(0).metrics().malformed_messages == 1
    })
    .await;
    assert!(counted);

    // The node keeps working
    let resolved = cluster
        .node(0)
        .merge_context("ctx", json!({"still": "alive"}), None)
        .await
        .unwrap();
    assert_eq!(resolved, map(json!({"still": "alive"})));
    log::info!(metrics = ?cluster.node(0).metrics(), "After malformed frame");

    cluster.stop().await;
}

#[tokio::test]
async fn test_sync_with_unreachable_node_reports_failure() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1", "n2"], test_config());

    cluster.bus.set_reachable(&NodeId::from("n2"), false);
    assert!(!cluster.node(0).sync_with_node(&NodeId::from("n2")).await);
    assert!(!cluster.node(0).sync_with_node(&NodeId::from("ghost")).await);

    cluster.bus.set_reachable(&NodeId::from("n2"), true);
    assert!(cluster.node(0).sync_with_node(&NodeId::from("n2")).await);

    cluster.stop().await;
}

#[tokio::test]
async fn test_invalid_context_is_rejected() {
    init_test_logging();
    let bus = LocalBus::new();
    let manager = ContextManager::new(
        test_config(),
        Arc::new(bus.join(NodeId::from("n1"))),
        Arc::new(NoOpContextPersistence::new()),
    )
    .unwrap();

    let err = manager
        .merge_context("ctx", json!(["not", "a", "map"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidContext { found: "array", .. }));

    // Empty maps are accepted and change nothing
    let resolved = manager.merge_context("ctx", json!({}), None).await.unwrap();
    assert!(resolved.is_empty());
    assert!(manager.vector_clock().is_empty());
    assert_eq!(manager.metrics().local_merges, 0);
}

#[tokio::test]
async fn test_start_twice_fails() {
    init_test_logging();
    let cluster = TestCluster::start(&["n1"], test_config());
    let (_tx, rx) = watch::channel(());
    assert!(matches!(
        cluster.node(0).start(rx),
        Err(ContextError::AlreadyStarted)
    ));
    cluster.stop().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let bus = LocalBus::new();
    let config = ContextMeshConfig {
        gossip_interval_ms: 0,
        ..Default::default()
    };
    let result = ContextManager::new(
        config,
        Arc::new(bus.join(NodeId::from("n1"))),
        Arc::new(NoOpContextPersistence::new()),
    );
    assert!(matches!(result, Err(ContextError::Config(_))));
}

#[tokio::test]
async fn test_idle_contexts_expire() {
    init_test_logging();
    let config = ContextMeshConfig {
        context_ttl_secs: Some(1),
        ..test_config()
    };
    let cluster = TestCluster::start(&["n1"], config);

    cluster
        .node(0)
        .merge_context("short-lived", json!({"a": 1}), None)
        .await
        .unwrap();

    let expired = wait_until(Duration::from_secs(4), || {
        cluster.node(0).get_context("short-lived").is_empty()
    })
    .await;
    assert!(expired);
    assert_eq!(cluster.node(0).metrics().contexts_expired, 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_expired_context_does_not_bounce_between_nodes() {
    init_test_logging();
    let config = ContextMeshConfig {
        context_ttl_secs: Some(1),
        ..test_config()
    };
    let cluster = TestCluster::start(&["n1", "n2"], config);

    cluster
        .node(0)
        .merge_context("short-lived", json!({"a": 1}), None)
        .await
        .unwrap();
    assert!(converged(&cluster, "short-lived", &map(json!({"a": 1}))).await);

    let expired = wait_until(Duration::from_secs(4), || {
        cluster
            .nodes
            .iter()
            .all(|node| node.manager.get_context("short-lived").is_empty())
    })
    .await;
    assert!(expired);

    // Several gossip rounds later it is still gone everywhere
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in &cluster.nodes {
        assert!(node.manager.get_context("short-lived").is_empty());
        assert_eq!(node.manager.metrics().contexts_expired, 1);
    }

    // A fresh write is replicated again
    cluster
        .node(0)
        .merge_context("short-lived", json!({"b": 2}), None)
        .await
        .unwrap();
    assert!(converged(&cluster, "short-lived", &map(json!({"b": 2}))).await);

    cluster.stop().await;
}

#[tokio::test]
async fn test_failed_saves_are_counted_not_returned() {
    init_test_logging();
    let bus = LocalBus::new();
    let (shutdown, signal) = watch::channel(());
    let manager = ContextManager::new(
        test_config(),
        Arc::new(bus.join(NodeId::from("n1"))),
        Arc::new(FailingPersistence),
    )
    .unwrap();
    let handles = manager.start(signal).unwrap();

    let resolved = manager
        .merge_context("ctx", json!({"a": 1}), None)
        .await
        .unwrap();
    assert_eq!(resolved, map(json!({"a": 1})));

    let counted = wait_until(CONVERGE, || manager.metrics().persistence_failures >= 1).await;
    assert!(counted);
    assert_eq!(manager.metrics().persistence_writes, 0);
    assert_eq!(manager.get_context("ctx"), map(json!({"a": 1})));

    let _ = shutdown.send(());
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_recover_with_unreadable_backend_starts_empty() {
    init_test_logging();
    let bus = LocalBus::new();
    let manager = ContextManager::new(
        test_config(),
        Arc::new(bus.join(NodeId::from("n1"))),
        Arc::new(FailingPersistence),
    )
    .unwrap();

    assert_eq!(manager.recover().await.unwrap(), 0);
    assert_eq!(manager.metrics().persistence_failures, 1);
    assert!(manager.list_contexts(&ContextMap::new()).is_empty());
}
