#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dscuss_net::{
    ConnectionProvider, PeerContext, PeerPool, ProviderConfig, StaticAddressProvider, SyncLimits,
};
use dscuss_shared::types::now;
use dscuss_shared::{Id, Message, PrivateKey, Subscriptions, Topic, User};
use dscuss_store::EntityStore;

pub struct Node {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<PeerContext>,
}

impl Node {
    pub fn new(nick: &str, subs: &str) -> Self {
        Self::with_limits(nick, subs, SyncLimits::default())
    }

    pub fn with_limits(nick: &str, subs: &str, sync_limits: SyncLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EntityStore::open(&dir.path().join("entities.db")).unwrap());
        let key = PrivateKey::generate();
        let user = User::emerge(&key, 0, nick, "", now()).unwrap();
        store.put_user(&user).unwrap();
        let ctx = Arc::new(PeerContext {
            store,
            key,
            user,
            subscriptions: Subscriptions::parse_lines(subs).unwrap(),
            pow_difficulty: 0,
            sync_limits,
        });
        Self { dir, ctx }
    }

    pub fn store(&self) -> &EntityStore {
        &self.ctx.store
    }

    pub fn post(&self, subject: &str, topic: &str) -> Message {
        let topic: Topic = topic.parse().unwrap();
        let msg = Message::emerge(
            &self.ctx.key,
            self.ctx.user.id(),
            subject,
            "text",
            Id::ZERO,
            Some(topic),
            now(),
        )
        .unwrap();
        self.store().put_message(&msg).unwrap();
        msg
    }

    pub async fn start(&self, dial: Vec<String>) -> PeerPool {
        let config = ProviderConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_in_conn: 8,
            max_out_conn: 8,
            bootstrap: Vec::new(),
        };
        let provider = ConnectionProvider::new(config, Box::new(StaticAddressProvider::new(dial)));
        PeerPool::start(self.ctx.clone(), provider).await.unwrap()
    }
}

/// Poll `cond` for up to ten seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
