use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lodestar::network::LocalTransport;
use lodestar::raft::{ClusterStatus, NodeRole, Raft, RaftConfig};
use tokio::time::sleep;

const IDS: [&str; 3] = ["a", "b", "c"];

async fn boot() -> (Arc<LocalTransport>, BTreeMap<String, Raft>) {
    let transport = Arc::new(LocalTransport::new());
    let mut rafts = BTreeMap::new();

    for id in IDS {
        let mut cfg = RaftConfig::new(id)
            .with_election_timeout(150, 300)
            .with_heartbeat_interval(50);
        for peer in IDS.iter().filter(|p| **p != id) {
            cfg.add_peer(peer, &format!("{peer}.local:7000"));
        }
        let raft = Raft::new(cfg, transport.clone()).expect("valid config");
        transport.register(id, raft.handle());
        rafts.insert(id.to_string(), raft);
    }
    for raft in rafts.values() {
        raft.start().await.expect("start");
    }
    (transport, rafts)
}

async fn statuses(rafts: &BTreeMap<String, Raft>) -> Vec<ClusterStatus> {
    let mut out = Vec::new();
    for raft in rafts.values() {
        out.push(raft.status().await);
    }
    out
}

/// Waits until exactly one node among `among` leads a term above `after_term`
/// and every other node in `among` follows it.
async fn wait_for_leader(
    rafts: &BTreeMap<String, Raft>,
    among: &[&str],
    after_term: u64,
) -> (String, u64) {
    for _ in 0..200 {
        sleep(Duration::from_millis(50)).await;
        let all = statuses(rafts).await;
        let group: Vec<_> = all
            .iter()
            .filter(|s| among.contains(&s.self_id.as_str()))
            .collect();
        let leaders: Vec<_> = group
            .iter()
            .filter(|s| s.is_leader() && s.current_term > after_term)
            .collect();
        if let [leader] = leaders.as_slice() {
            let followed = group.iter().all(|s| {
                s.current_term == leader.current_term
                    && s.leader_id.as_deref() == Some(leader.self_id.as_str())
            });
            if followed {
                return (leader.self_id.clone(), leader.current_term);
            }
        }
    }
    panic!("no stable leader among {among:?}");
}

async fn shutdown(rafts: &BTreeMap<String, Raft>) {
    for raft in rafts.values() {
        raft.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn three_nodes_elect_exactly_one_leader() {
    let (_transport, rafts) = boot().await;

    let (leader, term) = wait_for_leader(&rafts, &IDS, 0).await;

    // Heartbeats keep the same leader in place.
    sleep(Duration::from_secs(2)).await;
    let all = statuses(&rafts).await;
    let leaders: Vec<_> = all.iter().filter(|s| s.role == NodeRole::Leader).collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].self_id, leader);
    assert_eq!(leaders[0].current_term, term);
    for status in &all {
        assert_eq!(status.leader_id.as_deref(), Some(leader.as_str()));
    }

    shutdown(&rafts).await;
}

#[tokio::test(start_paused = true)]
async fn isolated_leader_is_replaced_and_rejoins_as_follower() {
    let (transport, rafts) = boot().await;
    let (old_leader, old_term) = wait_for_leader(&rafts, &IDS, 0).await;

    transport.isolate(&old_leader);
    let rest: Vec<&str> = IDS
        .iter()
        .copied()
        .filter(|id| *id != old_leader)
        .collect();
    let (new_leader, new_term) = wait_for_leader(&rafts, &rest, old_term).await;
    assert_ne!(new_leader, old_leader);
    assert!(new_term > old_term);

    transport.heal();
    let (leader, term) = wait_for_leader(&rafts, &IDS, old_term).await;
    assert!(term >= new_term);

    let old = rafts[&old_leader].status().await;
    assert_eq!(old.role, NodeRole::Follower);
    assert_eq!(old.leader_id.as_deref(), Some(leader.as_str()));

    shutdown(&rafts).await;
}

#[tokio::test(start_paused = true)]
async fn reporter_tracks_peer_roles() {
    let (_transport, rafts) = boot().await;
    let (leader, _) = wait_for_leader(&rafts, &IDS, 0).await;

    let follower = IDS.iter().find(|id| **id != leader).expect("follower");
    let status = rafts[*follower].status().await;
    let leader_peer = status.leader().expect("leader is a peer");
    assert_eq!(leader_peer.peer_id, leader);
    assert_eq!(leader_peer.last_known_role, Some(NodeRole::Leader));
    assert!(status.last_heartbeat_ago_ms < 300);

    shutdown(&rafts).await;
}
