//! Connection provider: accepts inbound TCP connections, dials candidate
//! addresses, and keeps the in/out counters honest as connections close.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dscuss_shared::constants::IO_DEADLINE;

use crate::address::{validate_address, AddressEvent, AddressProvider};
use crate::connection::{Connection, Direction};
use crate::error::Result;

const DIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// `host:port` to listen on; port 0 picks a free one.
    pub listen_addr: String,
    pub max_in_conn: usize,
    pub max_out_conn: usize,
    /// Seeded into the dial map before the address provider reports.
    pub bootstrap: Vec<String>,
}

#[derive(Default)]
struct Counters {
    in_count: AtomicUsize,
    out_count: AtomicUsize,
    /// Known outgoing addresses and whether a live connection uses them.
    out_addrs: RwLock<HashMap<String, bool>>,
}

impl Counters {
    fn learn(&self, addr: String) {
        if let Ok(mut map) = self.out_addrs.write() {
            if !map.contains_key(&addr) {
                debug!(addr = %addr, "new candidate address");
                map.insert(addr, false);
            }
        }
    }

    fn unused(&self) -> Vec<String> {
        match self.out_addrs.read() {
            Ok(map) => map
                .iter()
                .filter(|(_, in_use)| !**in_use)
                .map(|(addr, _)| addr.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn mark_used(&self, addr: &str) {
        if let Ok(mut map) = self.out_addrs.write() {
            map.insert(addr.to_string(), true);
        }
    }

    fn release(&self, addr: &str) {
        let was_out = match self.out_addrs.write() {
            Ok(mut map) => match map.get_mut(addr) {
                Some(in_use) if *in_use => {
                    *in_use = false;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };
        let counter = if was_out { &self.out_count } else { &self.in_count };
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        debug!(addr = %addr, outgoing = was_out, "address released");
    }
}

pub struct ConnectionProvider {
    config: ProviderConfig,
    address_provider: Box<dyn AddressProvider>,
    counters: Arc<Counters>,
    stop_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    local_addr: Option<SocketAddr>,
}

impl ConnectionProvider {
    pub fn new(config: ProviderConfig, address_provider: Box<dyn AddressProvider>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            address_provider,
            counters: Arc::new(Counters::default()),
            stop_tx,
            tasks: JoinSet::new(),
            local_addr: None,
        }
    }

    /// Bind the listener and start the accept, dial, release and address
    /// intake tasks. New connections arrive on the returned channel.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<Connection>> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "listening for peers");

        for addr in &self.config.bootstrap {
            match validate_address(addr) {
                Ok(addr) => self.counters.learn(addr),
                Err(reason) => warn!(addr = %addr, reason = %reason, "ignoring bootstrap address"),
            }
        }

        let (conn_tx, conn_rx) = mpsc::channel(16);
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let (addr_tx, addr_rx) = mpsc::channel(64);

        self.address_provider.register(addr_tx);
        self.address_provider.start();

        self.tasks.spawn(accept_loop(
            listener,
            self.config.max_in_conn,
            self.counters.clone(),
            conn_tx.clone(),
            release_tx.clone(),
            self.stop_tx.subscribe(),
        ));
        self.tasks.spawn(dial_loop(
            self.config.max_out_conn,
            self.counters.clone(),
            conn_tx,
            release_tx,
            self.stop_tx.subscribe(),
        ));
        self.tasks.spawn(release_loop(
            self.counters.clone(),
            release_rx,
            self.stop_tx.subscribe(),
        ));
        self.tasks.spawn(intake_loop(
            self.counters.clone(),
            addr_rx,
            self.stop_tx.subscribe(),
        ));

        Ok(conn_rx)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `(in_count, out_count)`.
    pub fn connection_counts(&self) -> (usize, usize) {
        (
            self.counters.in_count.load(Ordering::SeqCst),
            self.counters.out_count.load(Ordering::SeqCst),
        )
    }

    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.address_provider.stop();
        while self.tasks.join_next().await.is_some() {}
        info!("connection provider stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_in: usize,
    counters: Arc<Counters>,
    conn_tx: mpsc::Sender<Connection>,
    release_tx: mpsc::UnboundedSender<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if counters.in_count.load(Ordering::SeqCst) >= max_in {
            tokio::select! {
                _ = tokio::time::sleep(IO_DEADLINE) => continue,
                _ = stop_rx.changed() => break,
            }
        }
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    counters.in_count.fetch_add(1, Ordering::SeqCst);
                    info!(addr = %remote, "accepted connection");
                    let conn = Connection::new(
                        stream,
                        Direction::Passive,
                        remote.to_string(),
                        Some(release_tx.clone()),
                    );
                    if conn_tx.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = stop_rx.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

async fn dial_loop(
    max_out: usize,
    counters: Arc<Counters>,
    conn_tx: mpsc::Sender<Connection>,
    release_tx: mpsc::UnboundedSender<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    'outer: loop {
        for addr in counters.unused() {
            if counters.out_count.load(Ordering::SeqCst) >= max_out {
                break;
            }
            let dialed = tokio::select! {
                res = tokio::time::timeout(IO_DEADLINE, TcpStream::connect(&addr)) => res,
                _ = stop_rx.changed() => break 'outer,
            };
            match dialed {
                Ok(Ok(stream)) => {
                    counters.out_count.fetch_add(1, Ordering::SeqCst);
                    counters.mark_used(&addr);
                    info!(addr = %addr, "connected to peer");
                    let conn = Connection::new(
                        stream,
                        Direction::Active,
                        addr.clone(),
                        Some(release_tx.clone()),
                    );
                    if conn_tx.send(conn).await.is_err() {
                        break 'outer;
                    }
                }
                Ok(Err(e)) => debug!(addr = %addr, error = %e, "dial failed"),
                Err(_) => debug!(addr = %addr, "dial timed out"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(DIAL_INTERVAL) => {}
            _ = stop_rx.changed() => break,
        }
    }
    debug!("dial loop stopped");
}

async fn release_loop(
    counters: Arc<Counters>,
    mut release_rx: mpsc::UnboundedReceiver<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            addr = release_rx.recv() => match addr {
                Some(addr) => counters.release(&addr),
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
    debug!("release loop stopped");
}

async fn intake_loop(
    counters: Arc<Counters>,
    mut addr_rx: mpsc::Receiver<AddressEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = addr_rx.recv() => match event {
                Some(AddressEvent::Address(addr)) => match validate_address(&addr) {
                    Ok(addr) => counters.learn(addr),
                    Err(reason) => warn!(addr = %addr, reason = %reason, "invalid address"),
                },
                Some(AddressEvent::ParseError { input, reason }) => {
                    warn!(input = %input, reason = %reason, "address provider parse error");
                }
                Some(AddressEvent::IoError(e)) => warn!(error = %e, "address provider I/O error"),
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
    debug!("address intake stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::StaticAddressProvider;

    fn config(max_in: usize, max_out: usize) -> ProviderConfig {
        ProviderConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_in_conn: max_in,
            max_out_conn: max_out,
            bootstrap: Vec::new(),
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_release_accounting() {
        let c = Counters::default();
        c.learn("a.org:1".into());
        c.out_count.store(1, Ordering::SeqCst);
        c.in_count.store(1, Ordering::SeqCst);
        c.mark_used("a.org:1");
        assert!(c.unused().is_empty());

        c.release("a.org:1");
        assert_eq!(c.out_count.load(Ordering::SeqCst), 0);
        assert_eq!(c.unused(), vec!["a.org:1".to_string()]);

        c.release("127.0.0.1:5555");
        assert_eq!(c.in_count.load(Ordering::SeqCst), 0);
        // Never underflows.
        c.release("127.0.0.1:5555");
        assert_eq!(c.in_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let mut server = ConnectionProvider::new(
            config(4, 0),
            Box::new(StaticAddressProvider::new(Vec::new())),
        );
        let mut server_rx = server.start().await.unwrap();
        let server_addr = server.local_addr().unwrap().to_string();

        let mut client = ConnectionProvider::new(
            config(0, 4),
            Box::new(StaticAddressProvider::new(vec![server_addr.clone()])),
        );
        let mut client_rx = client.start().await.unwrap();

        let active = client_rx.recv().await.unwrap();
        let passive = server_rx.recv().await.unwrap();
        assert_eq!(active.direction(), Direction::Active);
        assert_eq!(active.remote_addr(), server_addr);
        assert_eq!(passive.direction(), Direction::Passive);
        assert_eq!(server.connection_counts(), (1, 0));
        assert_eq!(client.connection_counts(), (0, 1));

        // The address stays in use, so no second dial happens.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(client_rx.try_recv().is_err());

        drop(active);
        drop(passive);
        wait_for(|| client.connection_counts() == (0, 0)).await;
        wait_for(|| server.connection_counts() == (0, 0)).await;

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_accept_cap() {
        let mut server = ConnectionProvider::new(
            config(1, 0),
            Box::new(StaticAddressProvider::new(Vec::new())),
        );
        let mut rx = server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let held = rx.recv().await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        drop(held);
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(next.is_some());
        server.stop().await;
    }
}
