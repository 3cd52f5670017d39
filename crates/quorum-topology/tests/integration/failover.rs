//! Losing members, elections and the reconnect loop.

use std::time::Duration;

use quorum_topology::{
    HelloReply, MemberRole, ReadPreference, SelectionError, TopologyEvent, TopologyState,
};
use tokio::sync::broadcast::error::TryRecvError;

use crate::helpers::{
    addr, eventually, options, primary, secondary, topology, wait_for_event, SimulatedSet,
};

const ABC: &[&str] = &["a", "b", "c"];

fn healthy_set() -> std::sync::Arc<SimulatedSet> {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, ABC));
    set.set("b", secondary(ABC));
    set.set("c", secondary(ABC));
    set
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_losing_every_member() {
    let set = healthy_set();
    let topology = topology(&set, options(ABC));
    topology.connect().await.unwrap();
    eventually("all members probed", || topology.summary().unknown == 0).await;
    let mut events = topology.subscribe();

    for name in ABC {
        set.down(name);
    }
    topology.request_check();

    wait_for_event(&mut events, "disconnected", |e| {
        matches!(e, TopologyEvent::Disconnected)
    })
    .await;
    assert_ne!(topology.state(), TopologyState::Connected);
    assert_eq!(
        topology.get_server(&ReadPreference::primary()).unwrap_err(),
        SelectionError::NoPrimaryAvailable
    );

    // let a few reconnect rounds fail
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_ne!(topology.state(), TopologyState::Connected);

    set.set("a", primary(1, 1, ABC));
    wait_for_event(&mut events, "reconnected", |e| {
        matches!(e, TopologyEvent::Reconnected)
    })
    .await;
    eventually("primary restored", || {
        topology.state() == TopologyState::Connected
            && topology
                .get_server(&ReadPreference::primary())
                .map(|m| m.address == addr("a"))
                .unwrap_or(false)
    })
    .await;
    assert!(!topology.is_destroyed());
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn standalone_leftover_does_not_hold_off_reconnect() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, &["a", "b"]));
    set.set("b", secondary(&["a", "b"]));
    let topology = topology(&set, options(&["a", "b"]));
    topology.connect().await.unwrap();
    eventually("b probed", || topology.summary().secondaries == 1).await;
    let mut events = topology.subscribe();

    // b restarts without replication while a goes away
    set.set("b", HelloReply::default());
    set.down("a");
    topology.request_check();

    wait_for_event(&mut events, "disconnected", |e| {
        matches!(e, TopologyEvent::Disconnected)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_ne!(topology.state(), TopologyState::Connected);
    assert!(topology
        .get_servers()
        .iter()
        .all(|m| !m.role.is_member()));

    set.set("a", primary(1, 1, &["a", "b"]));
    wait_for_event(&mut events, "reconnected", |e| {
        matches!(e, TopologyEvent::Reconnected)
    })
    .await;
    eventually("primary restored", || {
        topology.state() == TopologyState::Connected
            && topology
                .get_server(&ReadPreference::primary())
                .map(|m| m.address == addr("a"))
                .unwrap_or(false)
    })
    .await;
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn failures_before_connect_do_not_count_toward_removal() {
    let set = SimulatedSet::new();
    set.set("a", primary(1, 1, ABC));
    set.set("b", secondary(ABC));
    set.set_latency("a", Duration::from_secs(3));
    // c never answers
    let topology = topology(&set, options(ABC));
    let mut events = topology.subscribe();

    topology.connect().await.unwrap();
    let max = topology.options().max_heartbeat_failures;
    let c = topology
        .get_servers()
        .into_iter()
        .find(|m| m.address == addr("c"))
        .expect("c kept after connect");
    assert!(c.consecutive_failures < max);

    wait_for_event(&mut events, "connected", |e| {
        matches!(e, TopologyEvent::Connected)
    })
    .await;
    let mut failures = 0;
    loop {
        let event = wait_for_event(&mut events, "c closed", |e| {
            matches!(
                e,
                TopologyEvent::HeartbeatFailed { address, .. }
                    | TopologyEvent::ServerClosed { address }
                    if *address == addr("c")
            )
        })
        .await;
        match event {
            TopologyEvent::ServerClosed { .. } => break,
            _ => failures += 1,
        }
    }
    assert!(
        (max - 1..=max).contains(&failures),
        "c removed after {failures} failures"
    );
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_member_is_demoted_then_removed() {
    let set = healthy_set();
    let topology = topology(&set, options(ABC));
    topology.connect().await.unwrap();
    eventually("all members probed", || topology.summary().unknown == 0).await;
    let mut events = topology.subscribe();

    set.down("c");
    topology.request_check();

    wait_for_event(&mut events, "c left", |e| {
        *e == TopologyEvent::MemberLeft {
            role: MemberRole::Secondary,
            address: addr("c"),
        }
    })
    .await;
    let c = topology
        .get_servers()
        .into_iter()
        .find(|m| m.address == addr("c"));
    if let Some(c) = c {
        assert_eq!(c.role, MemberRole::Unknown);
        assert!(c.last_error.is_some());
    }

    wait_for_event(&mut events, "c closed", |e| {
        *e == TopologyEvent::ServerClosed { address: addr("c") }
    })
    .await;
    assert_eq!(topology.state(), TopologyState::Connected);
    assert_eq!(
        topology.get_server(&ReadPreference::primary()).unwrap().address,
        addr("a")
    );
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn fails_over_to_new_primary() {
    let set = healthy_set();
    let topology = topology(&set, options(ABC));
    topology.connect().await.unwrap();
    eventually("all members probed", || topology.summary().unknown == 0).await;
    let mut events = topology.subscribe();

    set.down("a");
    set.set("b", primary(1, 2, ABC));
    topology.request_check();

    wait_for_event(&mut events, "b elected", |e| {
        *e == TopologyEvent::MemberJoined {
            role: MemberRole::Primary,
            address: addr("b"),
        }
    })
    .await;
    assert_eq!(
        topology.get_server(&ReadPreference::primary()).unwrap().address,
        addr("b")
    );
    assert_eq!(topology.state(), TopologyState::Connected);

    // the old primary comes back as a secondary
    set.set("a", secondary(ABC));
    eventually("a rejoins", || {
        topology
            .get_servers()
            .iter()
            .any(|m| m.address == addr("a") && m.role == MemberRole::Secondary)
    })
    .await;
    assert_eq!(topology.summary().primary, Some(addr("b")));
    topology.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn destroy_during_probe_stops_everything() {
    let set = healthy_set();
    let topology = topology(&set, options(ABC));
    topology.connect().await.unwrap();
    eventually("all members probed", || topology.summary().unknown == 0).await;

    set.set_latency("a", Duration::from_secs(5));
    topology.request_check();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut events = topology.subscribe();
    let mut lifecycle = topology.watch_state();
    topology.destroy().await;

    assert_eq!(topology.state(), TopologyState::Destroyed);
    assert_eq!(*lifecycle.borrow_and_update(), TopologyState::Destroyed);
    assert_eq!(topology.registry().live_members(), 0);
    assert!(topology.get_servers().is_empty());
    wait_for_event(&mut events, "closed", |e| {
        matches!(e, TopologyEvent::TopologyClosed { .. })
    })
    .await;

    // the in-flight probe never reports
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(matches!(
        events.try_recv(),
        Err(TryRecvError::Empty | TryRecvError::Closed)
    ));
    assert!(topology.connect().await.is_err());
}
