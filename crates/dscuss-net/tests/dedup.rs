mod common;

use std::time::Duration;

use common::{eventually, Node};
use dscuss_net::{PeerPool, PeerState};

/// One idle peer holding both addresses.
fn settled(pool: &PeerPool) -> bool {
    let peers = pool.list_peers();
    peers.len() == 1 && peers[0].state == PeerState::Idle && peers[0].addresses.len() == 2
}

#[tokio::test]
async fn test_two_dials_to_one_node_leave_one_peer() {
    let n1 = Node::new("alice", "linux");
    let n2 = Node::new("bob", "linux");

    let mut p1 = n1.start(Vec::new()).await;
    let port = p1.local_addr().unwrap().port();
    let direct = format!("127.0.0.1:{port}");
    let named = format!("localhost:{port}");
    let mut p2 = n2.start(vec![direct.clone(), named.clone()]).await;

    assert!(eventually(|| settled(&p2)).await);
    assert!(eventually(|| settled(&p1)).await);
    let peer = &p2.list_peers()[0];
    assert!(peer.addresses.contains(&direct));
    assert!(peer.addresses.contains(&named));
    assert_eq!(peer.nickname.as_deref(), Some("alice"));

    // The survivor accounts for both dials, so neither address is redialled.
    assert_eq!(p2.connection_counts(), (0, 2));
    assert_eq!(p1.connection_counts(), (2, 0));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(settled(&p2));
    assert_eq!(p2.connection_counts(), (0, 2));

    // Only the surviving connection records history.
    let history = n2.store().list_user_history().unwrap();
    assert!(history.is_empty());

    p1.stop().await;
    assert!(eventually(|| p2.list_peers().is_empty()).await);
    assert!(eventually(|| p2.connection_counts() == (0, 0)).await);
    assert_eq!(n2.store().list_user_history().unwrap().len(), 1);
    p2.stop().await;
}
