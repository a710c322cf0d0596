// Integration tests for address forwards on bridge networks
mod common;

use common::{Harness, config};
use nova_bridge::bgp::forward_owner;
use nova_bridge::db::{ForwardRecord, InstanceRecord, WarningType};
use nova_bridge::firewall::AddressForward;
use nova_bridge::forward::{ForwardPort, NetworkForwardPut, NetworkForwardsPost};
use nova_bridge::ip::HostNetwork;
use nova_bridge::network::ClientType;
use nova_bridge::{Cluster, NovaError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

const BASIC: &[(&str, &str)] = &[
    ("ipv4.address", "10.10.10.1/24"),
    ("ipv4.nat", "true"),
    ("ipv4.dhcp", "true"),
    ("ipv6.address", "none"),
];

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn web_forward(listen: &str) -> NetworkForwardsPost {
    NetworkForwardsPost {
        listen_address: listen.to_string(),
        put: NetworkForwardPut {
            description: "web".to_string(),
            config: BTreeMap::new(),
            ports: vec![ForwardPort {
                protocol: "tcp".to_string(),
                listen_port: "8080".to_string(),
                target_address: "10.10.10.5".to_string(),
                target_port: "80".to_string(),
                ..Default::default()
            }],
        },
    }
}

#[tokio::test]
async fn test_forward_programs_single_firewall_entry() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();

    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .expect("forward create should succeed");

    let firewall = h.firewall.snapshot();
    assert_eq!(
        firewall.forwards["br-test"],
        vec![AddressForward {
            listen_address: ip("198.51.100.10"),
            target_address: ip("10.10.10.5"),
            protocol: "tcp".to_string(),
            listen_ports: vec![8080],
            target_ports: vec![80],
            snat: false,
        }]
    );

    let forwards = network.forwards().unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].listen_address, "198.51.100.10");
    assert_eq!(forwards[0].location, "node1");

    let prefixes = h.bgp.prefixes(&forward_owner(network.id()));
    assert_eq!(prefixes, vec!["198.51.100.10/32".parse().unwrap()]);
}

#[tokio::test]
async fn test_duplicate_listen_address_conflicts() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();

    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();
    let err = network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap_err();

    assert!(matches!(err, NovaError::Conflict(_)));
    assert!(err.to_string().contains("already exists"));
    assert_eq!(network.forwards().unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_listen_address_on_another_member_is_allowed() {
    let cluster = Arc::new(Cluster::in_memory(1));
    let h = Harness::for_member(cluster.clone(), 1, "node1");
    let network = h.create("br-test", BASIC).await.unwrap();

    let peer = Harness::for_member(cluster.clone(), 2, "node2");
    let remote = peer.load("br-test");
    remote
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .expect("peer forward should succeed");

    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .expect("local forward should not clash with the peer's");

    let records = cluster
        .transaction(|tx| Ok(tx.network_forwards(&Default::default())))
        .unwrap();
    let mut members: Vec<Option<i64>> = records.iter().map(|r| r.node_id).collect();
    members.sort();
    assert_eq!(members, vec![Some(1), Some(2)]);

    // each member only sees and programs its own
    assert_eq!(network.forwards().unwrap().len(), 1);
    assert_eq!(h.firewall.snapshot().forwards["br-test"].len(), 1);
}

#[tokio::test]
async fn test_ambiguous_forward_lookup() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();

    let network_id = network.id();
    h.state
        .cluster
        .transaction(|tx| {
            for node_id in [None, Some(1)] {
                tx.create_network_forward(ForwardRecord {
                    id: 0,
                    network_id,
                    node_id,
                    listen_address: "198.51.100.20".to_string(),
                    description: String::new(),
                    ports: Vec::new(),
                    config: config(&[("target_address", "10.10.10.9")]),
                })?;
            }
            Ok(())
        })
        .unwrap();

    let err = network
        .forward_delete("198.51.100.20", ClientType::Normal)
        .unwrap_err();
    assert!(matches!(err, NovaError::Ambiguous(_)));
}

#[tokio::test]
async fn test_listen_address_used_by_other_network_conflicts() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    h.create(
        "br-other",
        &[
            ("ipv4.address", "192.0.2.1/24"),
            ("ipv4.nat", "false"),
            ("ipv6.address", "none"),
        ],
    )
    .await
    .unwrap();

    let err = network
        .forward_create(web_forward("192.0.2.50"), ClientType::Normal)
        .unwrap_err();
    assert!(matches!(err, NovaError::Conflict(_)));
    assert!(err.to_string().contains("overlaps with another network or NIC"));
    assert!(network.forwards().unwrap().is_empty());
}

#[tokio::test]
async fn test_identical_update_skips_writes() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    let forward = web_forward("198.51.100.10");
    network
        .forward_create(forward.clone(), ClientType::Normal)
        .unwrap();

    let writes = h.state.cluster.write_count();
    let calls = h.firewall.forward_calls();

    network
        .forward_update("198.51.100.10", forward.put.clone(), ClientType::Normal)
        .unwrap();

    assert_eq!(h.state.cluster.write_count(), writes);
    assert_eq!(h.firewall.forward_calls(), calls);
}

#[tokio::test]
async fn test_update_reprograms_firewall() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    let forward = web_forward("198.51.100.10");
    network
        .forward_create(forward.clone(), ClientType::Normal)
        .unwrap();

    let mut put = forward.put.clone();
    put.config
        .insert("target_address".to_string(), "10.10.10.7".to_string());
    network
        .forward_update("198.51.100.10", put, ClientType::Normal)
        .unwrap();

    let firewall = h.firewall.snapshot();
    let entries = &firewall.forwards["br-test"];
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].target_address, ip("10.10.10.7"));
    assert!(entries[0].protocol.is_empty());
}

#[tokio::test]
async fn test_delete_forward_clears_rules_and_prefixes() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();

    network
        .forward_delete("198.51.100.10", ClientType::Normal)
        .unwrap();

    assert!(!h.firewall.snapshot().forwards.contains_key("br-test"));
    assert!(h.bgp.prefixes(&forward_owner(network.id())).is_empty());
    assert!(network.forwards().unwrap().is_empty());

    let err = network
        .forward_delete("198.51.100.10", ClientType::Normal)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_invalid_forward_is_rejected_before_storing() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();

    let mut forward = web_forward("198.51.100.10");
    forward.put.ports[0].target_address = "not-an-ip".to_string();
    assert!(network.forward_create(forward, ClientType::Normal).is_err());
    assert!(network.forwards().unwrap().is_empty());
}

#[tokio::test]
async fn test_first_forward_enables_hairpin_on_instance_ports() {
    let h = Harness::new();
    h.host.add_host_link("veth-c1", "veth");
    h.state
        .cluster
        .transaction(|tx| {
            tx.create_instance(InstanceRecord {
                id: 0,
                project: "default".to_string(),
                name: "c1".to_string(),
                node: "node1".to_string(),
                config: config(&[("volatile.eth0.host_name", "veth-c1")]),
                devices: BTreeMap::from([(
                    "eth0".to_string(),
                    config(&[("type", "nic"), ("network", "br-test")]),
                )]),
            })
        })
        .unwrap();
    let network = h.create("br-test", BASIC).await.unwrap();

    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();

    assert!(h.host.snapshot().hairpin.contains("veth-c1"));
    assert!(h.host.interface_exists("veth-c1"));
}

#[tokio::test]
async fn test_missing_bridge_netfilter_raises_warning() {
    let h = Harness::new();
    *h.host.netfilter.lock().unwrap() = false;
    let network = h.create("br-test", BASIC).await.unwrap();

    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();

    let warnings = h.state.cluster.transaction(|tx| Ok(tx.warnings())).unwrap();
    assert!(warnings
        .iter()
        .any(|w| w.type_code == WarningType::ProxyBridgeNetfilterNotEnabled));

    // Forwards still get programmed
    assert_eq!(h.firewall.snapshot().forwards["br-test"].len(), 1);
}

fn stored_forwards(h: &Harness) -> Vec<ForwardRecord> {
    h.state
        .cluster
        .transaction(|tx| Ok(tx.network_forwards(&Default::default())))
        .unwrap()
}

#[tokio::test]
async fn test_failed_create_removes_record_and_rules() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();
    let firewall_before = h.firewall.snapshot();

    *h.firewall.fail_next_forwards.lock().unwrap() = 1;
    let err = network
        .forward_create(web_forward("198.51.100.11"), ClientType::Normal)
        .unwrap_err();
    assert!(err.to_string().contains("Failed applying firewall address forwards"));

    let records = stored_forwards(&h);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].listen_address, "198.51.100.10");
    assert_eq!(h.firewall.snapshot(), firewall_before);
    assert_eq!(
        h.bgp.prefixes(&forward_owner(network.id())),
        vec!["198.51.100.10/32".parse().unwrap()]
    );
}

#[tokio::test]
async fn test_failed_update_restores_previous_forward() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    let forward = web_forward("198.51.100.10");
    network
        .forward_create(forward.clone(), ClientType::Normal)
        .unwrap();
    let records_before = stored_forwards(&h);
    let firewall_before = h.firewall.snapshot();

    let mut put = forward.put.clone();
    put.ports[0].target_address = "10.10.10.9".to_string();
    *h.firewall.fail_next_forwards.lock().unwrap() = 1;
    assert!(network
        .forward_update("198.51.100.10", put, ClientType::Normal)
        .is_err());

    assert_eq!(stored_forwards(&h), records_before);
    assert_eq!(h.firewall.snapshot(), firewall_before);
}

#[tokio::test]
async fn test_failed_delete_recreates_forward() {
    let h = Harness::new();
    let network = h.create("br-test", BASIC).await.unwrap();
    network
        .forward_create(web_forward("198.51.100.10"), ClientType::Normal)
        .unwrap();
    let before = stored_forwards(&h);
    let firewall_before = h.firewall.snapshot();

    *h.firewall.fail_next_forwards.lock().unwrap() = 1;
    assert!(network
        .forward_delete("198.51.100.10", ClientType::Normal)
        .is_err());

    // the record comes back under a new id
    let after = stored_forwards(&h);
    assert_eq!(after.len(), 1);
    assert_eq!(
        ForwardRecord { id: before[0].id, ..after[0].clone() },
        before[0]
    );
    assert_eq!(h.firewall.snapshot(), firewall_before);
    assert_eq!(
        h.bgp.prefixes(&forward_owner(network.id())),
        vec!["198.51.100.10/32".parse().unwrap()]
    );
    assert_eq!(network.forwards().unwrap().len(), 1);
}
