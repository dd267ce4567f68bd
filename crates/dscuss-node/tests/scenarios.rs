//! Owner-level walkthroughs: register, post, reply, moderate, sync.

use std::path::Path;
use std::time::Duration;

use dscuss_node::{Config, Dscuss, DscussError};
use dscuss_shared::types::now;
use dscuss_shared::{Entity, Id, Message, Operation, OperationType, PrivateKey, Reason, User};

fn offline() -> Config {
    Config {
        pow_difficulty: 0,
        offline: true,
        ..Config::default()
    }
}

fn online(bootstrap: Vec<String>) -> Config {
    Config {
        hostname: "127.0.0.1".into(),
        port: 0,
        bootstrap_addresses: bootstrap,
        pow_difficulty: 0,
        ..Config::default()
    }
}

async fn logged_in(dir: &Path, config: Config, nick: &str, subs: &str) -> Dscuss {
    let mut node = Dscuss::with_config(dir, config).unwrap();
    node.register(nick, "", subs).await.unwrap();
    node.login(nick).await.unwrap();
    node
}

/// A user other than the owner, with its key.
fn stranger(nick: &str) -> (PrivateKey, User) {
    let key = PrivateKey::generate();
    let user = User::emerge(&key, 0, nick, "", now()).unwrap();
    (key, user)
}

fn thread_by(key: &PrivateKey, author: &User, subject: &str) -> Message {
    let topic = Some("linux".parse().unwrap());
    Message::emerge(key, author.id(), subject, "text", Id::ZERO, topic, now()).unwrap()
}

fn operation(key: &PrivateKey, author: &User, t: OperationType, object: Id) -> Operation {
    Operation::emerge(key, t, Reason::Spam, "", author.id(), object, now()).unwrap()
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_register_login_post_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = Dscuss::with_config(dir.path(), offline()).unwrap();
    let alice = node.register("alice", "hello", "linux,news").await.unwrap();
    assert_eq!(alice.info(), "hello");

    let session = node.login("alice").await.unwrap();
    let msg = session.new_thread("Subj", "Body", "linux,news").unwrap();
    assert!(msg.parent_id().is_zero());
    assert_eq!(msg.topic().unwrap().to_string(), "linux,news");
    assert_eq!(msg.author_id(), alice.id());

    assert_eq!(session.list_board(0, 10).unwrap(), vec![msg.clone()]);
    assert_eq!(session.list_topic("linux", 0, 10).unwrap(), vec![msg]);
    assert!(session.list_topic("rust", 0, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_reply_creation() {
    let dir = tempfile::tempdir().unwrap();
    let node = logged_in(dir.path(), offline(), "alice", "linux,news").await;
    let session = node.session().unwrap();

    let root = session.new_thread("Subj", "Body", "linux,news").unwrap();
    let reply = session.new_reply("Re: Subj", "reply body", &root.id()).unwrap();
    assert!(reply.topic().is_none());
    assert_eq!(reply.parent_id(), root.id());

    let thread = session.list_thread(&root.id()).unwrap().unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread.root().message(), &root);
    let child = thread.root().children()[0];
    assert_eq!(thread.node(child).unwrap().message(), &reply);

    // Replies never show up on the board.
    assert_eq!(session.list_board(0, 10).unwrap(), vec![root]);
}

#[tokio::test]
async fn test_moderation_drop() {
    let dir = tempfile::tempdir().unwrap();
    let node = logged_in(dir.path(), offline(), "owner", "linux").await;
    let session = node.session().unwrap();

    let (ka, a) = stranger("a");
    let (kb, b) = stranger("b");
    session.post_entity(&Entity::User(a.clone())).unwrap();
    session.post_entity(&Entity::User(b.clone())).unwrap();
    let m = thread_by(&kb, &b, "M");
    session.post_entity(&Entity::Message(m.clone())).unwrap();
    let op = operation(&ka, &a, OperationType::RemoveMessage, m.id());
    session.post_entity(&Entity::Operation(op.clone())).unwrap();

    assert_eq!(session.list_board(0, 10).unwrap(), vec![m.clone()]);

    session.add_moderator(&a.id()).unwrap();
    assert!(session.list_board(0, 10).unwrap().is_empty());
    assert!(session.list_thread(&m.id()).unwrap().is_none());
    assert_eq!(session.get_message(&m.id()).unwrap(), m);
    assert_eq!(session.list_operations_on_message(&m.id()).unwrap(), vec![op]);
    assert_eq!(session.list_moderators().unwrap(), vec![session.user().id(), a.id()]);

    session.remove_moderator(&a.id()).unwrap();
    assert_eq!(session.list_board(0, 10).unwrap(), vec![m]);
    assert!(matches!(
        session.remove_moderator(&session.user().id()),
        Err(DscussError::ForbiddenOperation)
    ));
}

#[tokio::test]
async fn test_ban_propagation() {
    let dir = tempfile::tempdir().unwrap();
    let node = logged_in(dir.path(), offline(), "owner", "linux").await;
    let session = node.session().unwrap();

    let (ka, a) = stranger("a");
    let (kc, c) = stranger("c");
    session.post_entity(&a.clone().into()).unwrap();
    session.post_entity(&c.clone().into()).unwrap();
    for subject in ["m1", "m2", "m3"] {
        session.post_entity(&thread_by(&kc, &c, subject).into()).unwrap();
    }
    session.add_moderator(&a.id()).unwrap();
    assert_eq!(session.list_board(0, 10).unwrap().len(), 3);

    let ban = operation(&ka, &a, OperationType::BanUser, c.id());
    assert!(session.post_entity(&ban.clone().into()).unwrap());
    assert!(!session.post_entity(&ban.into()).unwrap());

    assert!(session.list_board(0, 10).unwrap().is_empty());
    assert!(session.is_user_banned(&c.id()).unwrap());
    assert_eq!(session.get_user(&c.id()).unwrap(), c);
    assert_eq!(session.list_operations_on_user(&c.id()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_owner_operation_hides_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let node = logged_in(dir.path(), offline(), "owner", "linux").await;
    let session = node.session().unwrap();

    let (kb, b) = stranger("b");
    session.post_entity(&b.clone().into()).unwrap();
    let m = thread_by(&kb, &b, "spam");
    session.post_entity(&m.clone().into()).unwrap();

    session
        .new_operation(OperationType::RemoveMessage, Reason::Spam, "", &m.id())
        .unwrap();
    assert!(session.list_board(0, 10).unwrap().is_empty());
    assert!(matches!(
        session.new_operation(OperationType::BanUser, Reason::Abuse, "", &Id::digest(b"ghost")),
        Err(DscussError::NoSuchEntity)
    ));
}

#[tokio::test]
async fn test_two_sessions_sync() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut n1 = logged_in(dir1.path(), online(Vec::new()), "alice", "linux").await;
    let addr = n1.session().unwrap().listen_addr().unwrap();
    let posted: Vec<Message> = ["one", "two", "three"]
        .iter()
        .map(|s| n1.session().unwrap().new_thread(s, "text", "linux").unwrap())
        .collect();

    let mut n2 = logged_in(dir2.path(), online(vec![addr.to_string()]), "bob", "linux").await;
    let synced = eventually(|| {
        let board = n2.session().unwrap().list_board(0, 10).unwrap();
        posted.iter().all(|m| board.contains(m))
    })
    .await;
    assert!(synced);

    let connected = eventually(|| {
        n2.session()
            .unwrap()
            .list_peers()
            .iter()
            .any(|p| p.nickname.as_deref() == Some("alice"))
    })
    .await;
    assert!(connected);

    // Live: a reply written after the handshake reaches the other side.
    let reply = n2
        .session()
        .unwrap()
        .new_reply("Re: one", "text", &posted[0].id())
        .unwrap();
    let delivered = eventually(|| n1.session().unwrap().get_message(&reply.id()).is_ok()).await;
    assert!(delivered);

    n2.logout().await.unwrap();
    n1.logout().await.unwrap();
}
