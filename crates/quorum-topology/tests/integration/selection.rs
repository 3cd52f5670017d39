use std::collections::HashSet;
use std::time::Duration;

use quorum_topology::{ReadPreference, SelectionError, ServerAddress, Topology};

use crate::helpers::{
    addr, eventually, options, primary, secondary, topology, with_tags, SimulatedSet,
};

const ABC: &[&str] = &["a", "b", "c"];

async fn connected(set: &std::sync::Arc<SimulatedSet>) -> Topology {
    let topology = topology(set, options(ABC));
    topology.connect().await.unwrap();
    eventually("all members probed", || topology.summary().unknown == 0).await;
    topology
}

fn picks(topology: &Topology, pref: &ReadPreference, n: usize) -> HashSet<ServerAddress> {
    (0..n)
        .map(|_| topology.get_server(pref).unwrap().address)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn nearest_stays_within_latency_window() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, ABC));
    set.set("b", secondary(ABC));
    set.set("c", secondary(ABC));
    set.set_latency("a", Duration::from_millis(10));
    set.set_latency("b", Duration::from_millis(12));
    set.set_latency("c", Duration::from_millis(40));

    let topology = connected(&set).await;
    eventually("c measured", || {
        topology
            .get_servers()
            .iter()
            .all(|m| m.last_heartbeat_latency.is_some())
    })
    .await;

    let chosen = picks(&topology, &ReadPreference::nearest(), 20);
    assert_eq!(chosen, HashSet::from([addr("a"), addr("b")]));
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn secondaries_are_used_in_turn() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, ABC));
    set.set("b", secondary(ABC));
    set.set("c", secondary(ABC));
    let topology = connected(&set).await;

    let first = topology.get_server(&ReadPreference::secondary()).unwrap();
    let second = topology.get_server(&ReadPreference::secondary()).unwrap();
    let third = topology.get_server(&ReadPreference::secondary()).unwrap();
    assert_ne!(first.address, second.address);
    assert_eq!(first.address, third.address);

    // primary reads don't disturb the secondary rotation
    for _ in 0..3 {
        let p = topology.get_server(&ReadPreference::primary()).unwrap();
        assert_eq!(p.address, addr("a"));
    }
    let fourth = topology.get_server(&ReadPreference::secondary()).unwrap();
    assert_eq!(fourth.address, second.address);
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn tag_sets_pick_first_matching_set() {
    let set = SimulatedSet::new();
    set.set("a", with_tags(primary(1, 1, ABC), &[("dc", "east")]));
    set.set("b", with_tags(secondary(ABC), &[("dc", "east"), ("rack", "1")]));
    set.set("c", with_tags(secondary(ABC), &[("dc", "west")]));
    let topology = connected(&set).await;

    let west = ReadPreference::secondary().with_tags([("dc", "west")]);
    assert_eq!(picks(&topology, &west, 6), HashSet::from([addr("c")]));

    // first set matches nothing, second decides
    let fallback = ReadPreference::secondary()
        .with_tags([("dc", "north")])
        .with_tags([("rack", "1")]);
    assert_eq!(picks(&topology, &fallback, 6), HashSet::from([addr("b")]));

    let nowhere = ReadPreference::secondary().with_tags([("dc", "north")]);
    assert_eq!(
        topology.get_server(&nowhere).unwrap_err(),
        SelectionError::NoSecondaryAvailable
    );
    assert!(!topology.is_connected(&nowhere));

    // preferred modes fall back to the primary when no tagged secondary matches
    let preferred = ReadPreference::secondary_preferred().with_tags([("dc", "north")]);
    assert_eq!(topology.get_server(&preferred).unwrap().address, addr("a"));
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn preferred_modes_fall_back() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, &["a"]));
    let topology = topology(&set, options(&["a"]));
    topology.connect().await.unwrap();

    assert!(!topology.is_connected(&ReadPreference::secondary()));
    assert!(topology.is_connected(&ReadPreference::secondary_preferred()));
    assert_eq!(
        topology
            .get_server(&ReadPreference::secondary_preferred())
            .unwrap()
            .address,
        addr("a")
    );
    assert_eq!(
        topology.get_server(&ReadPreference::nearest()).unwrap().address,
        addr("a")
    );
    assert_eq!(
        topology.get_server(&ReadPreference::secondary()).unwrap_err(),
        SelectionError::NoSecondaryAvailable
    );
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn is_connected_reflects_preference() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, ABC));
    set.set("b", secondary(ABC));
    set.set("c", secondary(ABC));
    let topology = connected(&set).await;

    assert!(topology.is_connected(&ReadPreference::primary()));
    assert!(topology.is_connected(&ReadPreference::secondary()));

    set.down("b");
    set.down("c");
    topology.request_check();
    eventually("secondaries gone", || {
        !topology.is_connected(&ReadPreference::secondary())
    })
    .await;
    assert!(topology.is_connected(&ReadPreference::primary()));
    assert!(topology.is_connected(&ReadPreference::primary_preferred()));

    topology.destroy().await;
    assert!(!topology.is_connected(&ReadPreference::primary()));
}
