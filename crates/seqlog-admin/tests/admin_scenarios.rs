//! Cluster-membership scenarios against an in-memory config store and
//! a scripted failure detector.

use std::collections::BTreeMap;
use std::sync::Arc;

use seqlog_admin::error::ClusterMembershipFailureReason;
use seqlog_admin::types::*;
use seqlog_admin::{
    AdminError, ClusterMembershipHandler, StaticFailureDetector,
};
use seqlog_core::ShardId;
use seqlog_membership::codec;
use seqlog_membership::{
    InMemoryConfigStore, NodesConfiguration, SocketAddress, StorageState,
    UpdatableNodesConfiguration, RoleSet,
};

struct Cluster {
    handler: ClusterMembershipHandler,
    holder: Arc<UpdatableNodesConfiguration>,
    detector: Arc<StaticFailureDetector>,
}

fn empty_cluster() -> Cluster {
    let nc = NodesConfiguration::new_bootstrapping();
    let blob = codec::serialize(&nc).expect("serialize");
    let holder = Arc::new(UpdatableNodesConfiguration::new(nc));
    let store = Arc::new(InMemoryConfigStore::new(0, blob));
    let detector = Arc::new(StaticFailureDetector::new());
    let handler =
        ClusterMembershipHandler::new(holder.clone(), store, detector.clone());
    Cluster {
        handler,
        holder,
        detector,
    }
}

fn node_config(idx: i32, name: &str, port: u16) -> NodeConfig {
    NodeConfig {
        node_index: idx,
        name: name.to_string(),
        data_address: SocketAddress::tcp("10.2.0.1", port),
        gossip_address: Some(SocketAddress::tcp("10.2.0.1", port + 1)),
        ssl_address: None,
        admin_address: None,
        server_to_server_address: None,
        location: None,
        roles: RoleSet::both(),
        sequencer: Some(SequencerConfig { weight: 1.0 }),
        storage: Some(StorageConfig {
            capacity: 1.0,
            num_shards: 1,
        }),
        tags: BTreeMap::new(),
    }
}

fn add_request(configs: Vec<NodeConfig>) -> AddNodesRequest {
    AddNodesRequest {
        new_node_requests: configs
            .into_iter()
            .map(|new_config| AddSingleNodeRequest { new_config })
            .collect(),
    }
}

fn filter_for(idx: u16) -> NodesFilter {
    NodesFilter {
        node_indexes: Some(vec![idx]),
        ..Default::default()
    }
}

/// Four provisioned nodes N0..N3, bootstrapped and serving.
async fn bootstrapped_cluster() -> Cluster {
    let cluster = empty_cluster();
    let configs = (0..4)
        .map(|i| node_config(i, &format!("node{}", i), 4400 + (i as u16) * 10))
        .collect();
    cluster
        .handler
        .add_nodes(add_request(configs))
        .await
        .expect("add nodes");
    cluster
        .handler
        .mark_shards_as_provisioned(MarkShardsAsProvisionedRequest {
            shards: (0..4)
                .map(|i| ShardSelector {
                    node_index: i,
                    shard_index: -1,
                })
                .collect(),
        })
        .await
        .expect("mark provisioned");
    cluster
        .handler
        .bootstrap_cluster(BootstrapClusterRequest {
            metadata_replication_property: BTreeMap::from([("node".to_string(), 2u8)]),
        })
        .await
        .expect("bootstrap");
    cluster
}

fn unwrap_operation_failed(err: AdminError) -> Vec<(i32, ClusterMembershipFailureReason)> {
    match err {
        AdminError::OperationFailed(failed) => failed
            .failed_nodes
            .into_iter()
            .map(|f| (f.node_index, f.reason))
            .collect(),
        other => panic!("expected OperationFailed, got {other:?}"),
    }
}

// S1: removing a node that is still alive fails with NOT_DEAD and the
// version does not move.
#[tokio::test]
async fn test_remove_alive_node_fails() {
    let cluster = bootstrapped_cluster().await;
    let version_before = cluster.holder.get().version;

    let err = cluster
        .handler
        .remove_nodes(RemoveNodesRequest {
            node_filters: vec![filter_for(1)],
        })
        .await
        .unwrap_err();
    let failures = unwrap_operation_failed(err);
    assert_eq!(failures, vec![(1, ClusterMembershipFailureReason::NotDead)]);
    assert_eq!(cluster.holder.get().version, version_before);
}

// S2: dead but still enabled fails with NOT_DISABLED.
#[tokio::test]
async fn test_remove_dead_but_enabled_node_fails() {
    let cluster = bootstrapped_cluster().await;
    cluster.detector.mark_dead(1);

    let err = cluster
        .handler
        .remove_nodes(RemoveNodesRequest {
            node_filters: vec![filter_for(1)],
        })
        .await
        .unwrap_err();
    let failures = unwrap_operation_failed(err);
    assert_eq!(
        failures,
        vec![(1, ClusterMembershipFailureReason::NotDisabled)]
    );
}

// S3: disabled and dead removes cleanly; the config shrinks to three
// nodes.
#[tokio::test]
async fn test_remove_disabled_and_dead_node_succeeds() {
    let cluster = empty_cluster();
    let configs = (0..4)
        .map(|i| node_config(i, &format!("node{}", i), 4400 + (i as u16) * 10))
        .collect();
    cluster
        .handler
        .add_nodes(add_request(configs))
        .await
        .expect("add nodes");
    cluster
        .handler
        .mark_shards_as_provisioned(MarkShardsAsProvisionedRequest {
            shards: (0..4)
                .map(|i| ShardSelector {
                    node_index: i,
                    shard_index: -1,
                })
                .collect(),
        })
        .await
        .expect("mark provisioned");
    // N1's shard is still NONE (never bootstrapped) and its sequencer
    // was added disabled, so it is removable once dead.
    cluster.detector.mark_dead(1);

    let version_before = cluster.holder.get().version;
    let response = cluster
        .handler
        .remove_nodes(RemoveNodesRequest {
            node_filters: vec![filter_for(1)],
        })
        .await
        .expect("remove");
    assert_eq!(response.removed_nodes, vec![1]);
    assert_eq!(response.new_nodes_configuration_version, version_before + 1);

    let config_response = cluster.handler.get_nodes_config(&NodesFilter::default());
    assert_eq!(config_response.nodes.len(), 3);
    assert!(config_response.nodes.iter().all(|n| n.node_index != 1));
}

// S4: adding a node with a duplicate data address fails ALREADY_EXISTS.
#[tokio::test]
async fn test_add_duplicate_address_fails() {
    let cluster = bootstrapped_cluster().await;

    let mut dup = node_config(100, "node100", 9999);
    // Same data address as N0.
    dup.data_address = SocketAddress::tcp("10.2.0.1", 4400);
    let err = cluster
        .handler
        .add_nodes(add_request(vec![dup]))
        .await
        .unwrap_err();
    let failures = unwrap_operation_failed(err);
    assert_eq!(
        failures,
        vec![(100, ClusterMembershipFailureReason::AlreadyExists)]
    );
}

// S5: storage role without storage config is invalid.
#[tokio::test]
async fn test_add_missing_storage_config_fails() {
    let cluster = bootstrapped_cluster().await;

    let mut bad = node_config(4, "node4", 5555);
    bad.storage = None;
    let err = cluster
        .handler
        .add_nodes(add_request(vec![bad]))
        .await
        .unwrap_err();
    let failures = unwrap_operation_failed(err);
    assert_eq!(
        failures,
        vec![(4, ClusterMembershipFailureReason::InvalidRequestNodesConfig)]
    );
}

// S6: location is immutable; the update surfaces INVALID_PARAM from
// the configuration manager.
#[tokio::test]
async fn test_update_immutable_location_fails() {
    let cluster = bootstrapped_cluster().await;

    let mut changed = cluster
        .handler
        .get_nodes_config(&filter_for(3))
        .nodes
        .remove(0);
    changed.location = Some("r9.d9.c9.w9.k9".to_string());
    let err = cluster
        .handler
        .update_nodes(UpdateNodesRequest {
            node_requests: vec![UpdateSingleNodeRequest {
                node_to_be_updated: 3,
                new_config: changed,
            }],
        })
        .await
        .unwrap_err();
    match err {
        AdminError::NodesConfigurationManager { status, .. } => {
            assert_eq!(status, seqlog_core::Status::InvalidParam);
        }
        other => panic!("expected NodesConfigurationManager, got {other:?}"),
    }
}

// S7: -1 expands to all shards; only shards still PROVISIONING are
// reported, and the call is idempotent.
#[tokio::test]
async fn test_mark_shards_as_provisioned_expansion() {
    let cluster = bootstrapped_cluster().await;

    let mut n100 = node_config(100, "node100", 8000);
    n100.storage = Some(StorageConfig {
        capacity: 1.0,
        num_shards: 2,
    });
    let mut n101 = node_config(101, "node101", 8010);
    n101.storage = Some(StorageConfig {
        capacity: 1.0,
        num_shards: 2,
    });
    cluster
        .handler
        .add_nodes(add_request(vec![n100, n101]))
        .await
        .expect("add");

    let response = cluster
        .handler
        .mark_shards_as_provisioned(MarkShardsAsProvisionedRequest {
            shards: vec![
                ShardSelector {
                    node_index: 100,
                    shard_index: -1,
                },
                ShardSelector {
                    node_index: 101,
                    shard_index: 0,
                },
            ],
        })
        .await
        .expect("mark");
    assert_eq!(
        response.updated_shards,
        vec![
            ShardId::new(100, 0),
            ShardId::new(100, 1),
            ShardId::new(101, 0)
        ]
    );

    // (101, 1) is still PROVISIONING.
    let config = cluster.holder.get();
    assert_eq!(
        config
            .storage_membership
            .shard_state(ShardId::new(101, 1))
            .unwrap()
            .storage_state,
        StorageState::Provisioning
    );

    // A second identical call changes nothing and reports no shards.
    let version = cluster.holder.get().version;
    let again = cluster
        .handler
        .mark_shards_as_provisioned(MarkShardsAsProvisionedRequest {
            shards: vec![ShardSelector {
                node_index: 100,
                shard_index: -1,
            }],
        })
        .await
        .expect("mark again");
    assert!(again.updated_shards.is_empty());
    assert_eq!(again.new_nodes_configuration_version, version);
}

// Bump-generation moves exactly the matched nodes by one.
#[tokio::test]
async fn test_bump_generation_is_isolated() {
    let cluster = bootstrapped_cluster().await;
    let before = cluster.holder.get();
    assert_eq!(before.node_generation(2), Some(1));

    let response = cluster
        .handler
        .bump_node_generation(BumpGenerationRequest {
            node_filters: vec![filter_for(2)],
        })
        .await
        .expect("bump");
    assert_eq!(response.bumped_nodes, vec![2]);

    let after = cluster.holder.get();
    assert_eq!(after.node_generation(2), Some(2));
    for idx in [0u16, 1, 3] {
        assert_eq!(after.node_generation(idx), Some(1), "N{idx} unchanged");
    }
}

// Bootstrap is idempotent: the second call reports ALREADY_BOOTSTRAPPED
// and leaves the configuration untouched.
#[tokio::test]
async fn test_bootstrap_already_bootstrapped() {
    let cluster = bootstrapped_cluster().await;
    let version = cluster.holder.get().version;

    let err = cluster
        .handler
        .bootstrap_cluster(BootstrapClusterRequest {
            metadata_replication_property: BTreeMap::from([("node".to_string(), 2u8)]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::AlreadyBootstrapped));
    assert_eq!(cluster.holder.get().version, version);
}

// Bootstrap enables every NONE shard and every sequencer.
#[tokio::test]
async fn test_bootstrap_enables_cluster() {
    let cluster = bootstrapped_cluster().await;
    let config = cluster.holder.get();
    assert!(config.is_bootstrapped());
    for idx in 0..4u16 {
        assert!(config
            .storage_membership
            .can_write_to_shard(ShardId::new(idx, 0)));
        assert!(config.sequencer_membership.is_enabled(idx));
    }
}

// An unsatisfiable replication property is rejected up front.
#[tokio::test]
async fn test_bootstrap_rejects_oversized_replication() {
    let cluster = empty_cluster();
    cluster
        .handler
        .add_nodes(add_request(vec![node_config(0, "only", 4400)]))
        .await
        .expect("add");
    cluster
        .handler
        .mark_shards_as_provisioned(MarkShardsAsProvisionedRequest {
            shards: vec![ShardSelector {
                node_index: 0,
                shard_index: -1,
            }],
        })
        .await
        .expect("mark");

    let err = cluster
        .handler
        .bootstrap_cluster(BootstrapClusterRequest {
            metadata_replication_property: BTreeMap::from([("node".to_string(), 3u8)]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::InvalidRequest(_)));
}

// ANY_NODE_IDX picks free indices; removal frees them for reuse.
#[tokio::test]
async fn test_any_node_index_allocation() {
    let cluster = empty_cluster();
    let mut config = node_config(ANY_NODE_IDX, "auto0", 4400);
    config.sequencer = None;
    let response = cluster
        .handler
        .add_nodes(add_request(vec![
            config,
            node_config(ANY_NODE_IDX, "auto1", 4410),
        ]))
        .await
        .expect("add");
    let indexes: Vec<i32> = response.added_nodes.iter().map(|n| n.node_index).collect();
    assert_eq!(indexes, vec![0, 1]);
}

// A filter matching nothing simply removes nothing.
#[tokio::test]
async fn test_remove_with_empty_match() {
    let cluster = bootstrapped_cluster().await;
    let version = cluster.holder.get().version;
    let response = cluster
        .handler
        .remove_nodes(RemoveNodesRequest {
            node_filters: vec![NodesFilter {
                name: Some("no-such-node".to_string()),
                ..Default::default()
            }],
        })
        .await
        .expect("remove");
    assert!(response.removed_nodes.is_empty());
    assert_eq!(response.new_nodes_configuration_version, version);
}
