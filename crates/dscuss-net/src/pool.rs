//! Peer pool: turns new connections into peer tasks and tracks them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::Result;
use crate::peer::{Peer, PeerContext, PeerHandle, PeerInfo, PoolEvent};
use crate::provider::ConnectionProvider;

type PeerMap = Arc<RwLock<HashMap<u64, PeerHandle>>>;

pub struct PeerPool {
    provider: ConnectionProvider,
    peers: PeerMap,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PeerPool {
    /// Start `provider` and serve every connection it produces.
    pub async fn start(ctx: Arc<PeerContext>, mut provider: ConnectionProvider) -> Result<Self> {
        let conn_rx = provider.start().await?;
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(pool_loop(ctx, conn_rx, peers.clone(), stop_rx));
        info!("peer pool started");
        Ok(Self {
            provider,
            peers,
            stop_tx,
            task: Some(task),
        })
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let Ok(peers) = self.peers.read() else {
            return Vec::new();
        };
        let mut list: Vec<PeerInfo> = peers
            .values()
            .filter_map(|handle| handle.info.read().ok().map(|info| info.clone()))
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.provider.local_addr()
    }

    /// `(incoming, outgoing)` connections the provider currently counts.
    pub fn connection_counts(&self) -> (usize, usize) {
        self.provider.connection_counts()
    }

    /// Stop every peer, wait for them, then stop the connection provider.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.provider.stop().await;
        info!("peer pool stopped");
    }
}

async fn pool_loop(
    ctx: Arc<PeerContext>,
    mut conn_rx: mpsc::Receiver<Connection>,
    peers: PeerMap,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<PoolEvent>(64);
    let mut tasks = JoinSet::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            conn = conn_rx.recv() => {
                let Some(conn) = conn else { break };
                let id = next_id;
                next_id += 1;
                let (peer, handle) = Peer::new(id, conn, ctx.clone(), event_tx.clone(), stop_rx.clone());
                if let Ok(mut map) = peers.write() {
                    map.insert(id, handle);
                }
                tasks.spawn(peer.run());
            }
            Some(event) = event_rx.recv() => handle_event(&peers, event),
            Some(res) = tasks.join_next() => {
                if let Err(e) = res {
                    debug!(error = %e, "peer task failed");
                }
            }
            _ = stop_rx.changed() => break,
        }
    }

    // Peers observe the same stop signal; keep draining their events so
    // none of them blocks on a full channel while exiting.
    drop(event_tx);
    while !tasks.is_empty() {
        tokio::select! {
            Some(event) = event_rx.recv() => handle_event(&peers, event),
            _ = tasks.join_next() => {}
        }
    }
    while let Ok(event) = event_rx.try_recv() {
        handle_event(&peers, event);
    }
    debug!("pool loop finished");
}

fn handle_event(peers: &PeerMap, event: PoolEvent) {
    match event {
        PoolEvent::Handshaked {
            peer_id,
            user_id,
            reply,
        } => {
            let Ok(mut map) = peers.write() else {
                let _ = reply.send(false);
                return;
            };
            let duplicate = map
                .iter()
                .any(|(id, handle)| *id != peer_id && handle.user_id == Some(user_id));
            if let Some(handle) = map.get_mut(&peer_id) {
                handle.user_id = Some(user_id);
            }
            let _ = reply.send(duplicate);
        }
        PoolEvent::Leaving {
            peer_id,
            user_id,
            reply,
        } => {
            let survivor = peers.read().ok().and_then(|map| {
                map.iter()
                    .find(|(id, handle)| **id != peer_id && handle.user_id == Some(user_id))
                    .map(|(_, handle)| handle.control_tx.clone())
            });
            let _ = reply.send(survivor);
        }
        PoolEvent::Gone { peer_id, mut conn } => {
            conn.close();
            if let Ok(mut map) = peers.write() {
                map.remove(&peer_id);
            }
            debug!(peer = peer_id, "peer removed");
        }
    }
}
