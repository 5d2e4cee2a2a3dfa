//! Integration tests for ring formation over a shared broadcast segment.
//!
//! Three nodes on one in-memory segment must discover each other via hellos,
//! bootstrap ring membership through setup rounds, route application data
//! across the resulting paths, and repair the ring when a member dies.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use vrr::{LinkAddr, MemSegment, Node, NodeId, VrrConfig};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(100);

fn addr(last: u8) -> LinkAddr {
    LinkAddr::from_bytes([0x02, 0, 0, 0, 0, last])
}

fn fast_config(id: u32) -> VrrConfig {
    VrrConfig {
        id: Some(id),
        hello_interval: Duration::from_millis(50),
        fail_timeout_ticks: 3,
        activate_timeout_ticks: 4,
        ..VrrConfig::default()
    }
}

fn start_node(segment: &Arc<MemSegment>, id: u32, addr_last: u8) -> Node {
    let iface = segment.attach(format!("vrr{addr_last}"), addr(addr_last));
    Node::start(fast_config(id), vec![iface]).expect("node start")
}

/// Every node is active and holds every other node in its vset.
async fn ring_formed(nodes: &[&Node]) -> bool {
    for node in nodes {
        if !node.is_active().await {
            return false;
        }
        let vset = node.vset_members().await;
        for other in nodes {
            let other_id = other.local_id();
            if other_id != node.local_id() && !vset.contains(&other_id) {
                return false;
            }
        }
    }
    true
}

async fn wait_for_ring(nodes: &[&Node]) {
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    loop {
        if ring_formed(nodes).await {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "ring did not form within {CONVERGE_TIMEOUT:?}"
        );
        sleep(POLL).await;
    }
}

#[tokio::test]
async fn ring_forms_on_shared_segment() {
    let segment = MemSegment::new();
    let a = start_node(&segment, 100, 1);
    let b = start_node(&segment, 200, 2);
    let c = start_node(&segment, 300, 3);

    wait_for_ring(&[&a, &b, &c]).await;

    // Physical links came up both ways underneath the ring.
    for node in [&a, &b, &c] {
        let pset = node.pset_members().await;
        assert_eq!(pset.len(), 2, "node {} pset", node.local_id());
        assert!(pset.iter().all(|e| e.status == vrr::LinkStatus::Linked));
    }
}

#[tokio::test]
async fn data_routes_across_the_ring() {
    let segment = MemSegment::new();
    let a = start_node(&segment, 100, 1);
    let b = start_node(&segment, 200, 2);
    let c = start_node(&segment, 300, 3);

    let mut c_rx = c.messages().await.expect("take once");

    wait_for_ring(&[&a, &b, &c]).await;

    let payload = b"over the ring".to_vec();
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    loop {
        assert!(Instant::now() < deadline, "data never arrived");
        if a
            .send_data(c.local_id(), payload.clone())
            .await
            .is_err()
        {
            // Route not established yet; the next hello cycle retries setup.
            sleep(POLL).await;
            continue;
        }
        match timeout(Duration::from_millis(500), c_rx.recv()).await {
            Ok(Some((src, data))) => {
                assert_eq!(src, a.local_id());
                assert_eq!(data, payload);
                break;
            }
            Ok(None) => panic!("delivery channel closed"),
            Err(_) => continue,
        }
    }
}

#[tokio::test]
async fn failed_node_is_purged_and_ring_repairs() {
    let segment = MemSegment::new();
    let a = start_node(&segment, 100, 1);
    let mut b = start_node(&segment, 200, 2);
    let c = start_node(&segment, 300, 3);

    wait_for_ring(&[&a, &b, &c]).await;

    let b_id = b.local_id();
    b.shutdown();

    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let a_pset: Vec<NodeId> = a.pset_members().await.iter().map(|e| e.node).collect();
        let c_pset: Vec<NodeId> = c.pset_members().await.iter().map(|e| e.node).collect();
        let a_vset = a.vset_members().await;
        let c_vset = c.vset_members().await;

        let purged = !a_pset.contains(&b_id)
            && !c_pset.contains(&b_id)
            && !a_vset.contains(&b_id)
            && !c_vset.contains(&b_id);
        let survivors_linked = a_vset.contains(&c.local_id()) && c_vset.contains(&a.local_id());

        if purged && survivors_linked {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "ring did not repair: a_vset={a_vset:?} c_vset={c_vset:?} \
             a_pset={a_pset:?} c_pset={c_pset:?}"
        );
        sleep(POLL).await;
    }
}
