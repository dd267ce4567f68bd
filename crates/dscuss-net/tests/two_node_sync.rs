mod common;

use chrono::Duration;

use common::{eventually, Node};
use dscuss_net::{Direction, PeerState};
use dscuss_shared::types::now;
use dscuss_shared::{Entity, Id, Message, Operation, OperationType, PrivateKey, Reason, User};

#[tokio::test]
async fn test_initial_sync_transfers_everything() {
    let n1 = Node::new("alice", "linux");
    let n2 = Node::new("bob", "linux");
    let posted: Vec<Message> = (0..3).map(|i| n1.post(&format!("post {i}"), "linux")).collect();

    let before = now() - Duration::seconds(1);
    let mut p1 = n1.start(Vec::new()).await;
    let addr = p1.local_addr().unwrap().to_string();
    let mut p2 = n2.start(vec![addr]).await;

    assert!(
        eventually(|| {
            n2.store()
                .get_messages_stored_after(before, 1000)
                .map(|m| m.len() == 3)
                .unwrap_or(false)
        })
        .await
    );
    for msg in &posted {
        assert_eq!(n2.store().get_message(&msg.id()).unwrap(), *msg);
    }

    assert!(eventually(|| p2.list_peers().iter().any(|p| p.state == PeerState::Idle)).await);
    let peers = p2.list_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].direction, Direction::Active);
    assert_eq!(peers[0].nickname.as_deref(), Some("alice"));

    p2.stop().await;
    p1.stop().await;
}

#[tokio::test]
async fn test_unsubscribed_topics_are_not_synced() {
    let n1 = Node::new("alice", "linux\nnews");
    let n2 = Node::new("bob", "linux");
    let wanted = n1.post("kernel", "linux");
    let other = n1.post("headlines", "news");

    let mut p1 = n1.start(Vec::new()).await;
    let addr = p1.local_addr().unwrap().to_string();
    let mut p2 = n2.start(vec![addr]).await;

    assert!(eventually(|| n2.store().has_message(&wanted.id()).unwrap()).await);
    assert!(eventually(|| p2.list_peers().iter().any(|p| p.state == PeerState::Idle)).await);
    assert!(!n2.store().has_message(&other.id()).unwrap());

    p2.stop().await;
    p1.stop().await;
}

#[tokio::test]
async fn test_prerequisites_fetched_on_demand() {
    let n1 = Node::new("alice", "linux");
    let n2 = Node::new("bob", "linux");

    // Carol never connects; her user travels as a prerequisite.
    let carol_key = PrivateKey::generate();
    let carol = User::emerge(&carol_key, 0, "carol", "", now()).unwrap();
    n1.store().put_user(&carol).unwrap();
    let root = n1.post("root", "linux");
    let reply = Message::emerge(
        &carol_key,
        carol.id(),
        "re: root",
        "reply",
        root.id(),
        None,
        now(),
    )
    .unwrap();
    n1.store().put_message(&reply).unwrap();
    let ban = Operation::emerge(
        &n1.ctx.key,
        OperationType::BanUser,
        Reason::Spam,
        "",
        n1.ctx.user.id(),
        carol.id(),
        now(),
    )
    .unwrap();
    n1.store().put_operation(&ban).unwrap();

    let mut p1 = n1.start(Vec::new()).await;
    let addr = p1.local_addr().unwrap().to_string();
    let mut p2 = n2.start(vec![addr]).await;

    assert!(eventually(|| n2.store().has_operation(&ban.id()).unwrap()).await);
    assert_eq!(n2.store().get_user(&carol.id()).unwrap(), carol);
    assert_eq!(n2.store().get_thread_root(&reply.id()).unwrap(), root);

    p2.stop().await;
    p1.stop().await;
}

#[tokio::test]
async fn test_live_entities_are_announced() {
    let n1 = Node::new("alice", "linux");
    let n2 = Node::new("bob", "linux");

    let mut p1 = n1.start(Vec::new()).await;
    let addr = p1.local_addr().unwrap().to_string();
    let mut p2 = n2.start(vec![addr]).await;
    assert!(eventually(|| p1.list_peers().iter().any(|p| p.state == PeerState::Idle)).await);
    assert!(eventually(|| p2.list_peers().iter().any(|p| p.state == PeerState::Idle)).await);

    let topic = "linux".parse().unwrap();
    let msg = Message::emerge(
        &n2.ctx.key,
        n2.ctx.user.id(),
        "live",
        "posted after connecting",
        Id::ZERO,
        Some(topic),
        now(),
    )
    .unwrap();
    n2.store().put_entity(&Entity::Message(msg.clone()), None).unwrap();

    assert!(eventually(|| n1.store().has_message(&msg.id()).unwrap()).await);

    p2.stop().await;
    p1.stop().await;
}

#[tokio::test]
async fn test_history_recorded_after_disconnect() {
    let n1 = Node::new("alice", "linux");
    let n2 = Node::new("bob", "linux");

    let mut p1 = n1.start(Vec::new()).await;
    let addr = p1.local_addr().unwrap().to_string();
    let mut p2 = n2.start(vec![addr]).await;
    assert!(eventually(|| p2.list_peers().iter().any(|p| p.state == PeerState::Idle)).await);

    p2.stop().await;
    assert!(eventually(|| n2.store().get_user_history(&n1.ctx.user.id()).is_ok()).await);
    assert!(eventually(|| n1.store().get_user_history(&n2.ctx.user.id()).is_ok()).await);
    assert!(eventually(|| p1.list_peers().is_empty()).await);
    assert!(eventually(|| p1.connection_counts() == (0, 0)).await);

    p1.stop().await;
}
