//! DHT address provider on libp2p Kademlia.
//!
//! Every refresh the node announces itself as a provider for the SHA-1 of
//! each topic combination it subscribes to and asks the DHT for the other
//! providers of those keys. A provider's dscuss TCP port is learnt from its
//! identify agent string (`dscuss/<port>`) and its IPs from its listen and
//! observed addresses.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    multiaddr::Protocol,
    swarm::{NetworkBehaviour, SwarmEvent},
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dscuss_shared::constants::{ADDRESS_REFRESH_INTERVAL, DHT_PROTOCOL_VERSION};
use dscuss_shared::Subscriptions;

use crate::address::{AddressEvent, AddressProvider};

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/dscuss/kad/1.0.0");
const AGENT_PREFIX: &str = "dscuss/";

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "DhtEvent")]
pub struct DhtBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum DhtEvent {
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<kad::Event> for DhtEvent {
    fn from(event: kad::Event) -> Self {
        DhtEvent::Kademlia(event)
    }
}

impl From<identify::Event> for DhtEvent {
    fn from(event: identify::Event) -> Self {
        DhtEvent::Identify(event)
    }
}

pub fn build_swarm(tcp_port: u16) -> anyhow::Result<Swarm<DhtBehaviour>> {
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<DhtBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            let mut kad_config = kad::Config::new(KAD_PROTOCOL);
            kad_config.set_query_timeout(Duration::from_secs(30));
            let mut kademlia =
                kad::Behaviour::with_config(local_peer_id, MemoryStore::new(local_peer_id), kad_config);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(DHT_PROTOCOL_VERSION.to_string(), key.public())
                    .with_agent_version(format!("{AGENT_PREFIX}{tcp_port}"));
            let identify = identify::Behaviour::new(identify_config);

            Ok(DhtBehaviour { kademlia, identify })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), tcp_port, "built DHT swarm");
    Ok(swarm)
}

/// The dscuss TCP port a remote advertises in its identify agent string.
fn tcp_port_from_agent(agent: &str) -> Option<u16> {
    agent.strip_prefix(AGENT_PREFIX)?.parse().ok().filter(|p| *p != 0)
}

fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        _ => None,
    })
}

fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

#[derive(Default)]
struct Remote {
    ips: Vec<IpAddr>,
    tcp_port: Option<u16>,
}

/// What the provider has learnt about the swarm so far.
struct DhtState {
    tcp_port: u16,
    local_ips: HashSet<IpAddr>,
    remotes: HashMap<PeerId, Remote>,
    /// Providers found before their identify info arrived.
    wanted: HashSet<PeerId>,
}

impl DhtState {
    fn new(tcp_port: u16) -> Self {
        let mut local_ips = HashSet::new();
        local_ips.insert(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        Self {
            tcp_port,
            local_ips,
            remotes: HashMap::new(),
            wanted: HashSet::new(),
        }
    }

    fn add_ip(&mut self, peer: PeerId, ip: IpAddr) {
        let remote = self.remotes.entry(peer).or_default();
        if !remote.ips.contains(&ip) {
            remote.ips.push(ip);
        }
    }

    /// `ip:port` strings for `peer`, skipping our own listen endpoint.
    fn addresses_for(&self, peer: &PeerId) -> Vec<String> {
        let Some(remote) = self.remotes.get(peer) else {
            return Vec::new();
        };
        let Some(port) = remote.tcp_port else {
            return Vec::new();
        };
        remote
            .ips
            .iter()
            .filter(|ip| !(self.local_ips.contains(ip) && port == self.tcp_port))
            .map(|ip| format!("{ip}:{port}"))
            .collect()
    }
}

pub struct DhtConfig {
    pub dht_port: u16,
    pub tcp_port: u16,
    /// Multiaddrs with a `/p2p/` suffix.
    pub bootstrap: Vec<String>,
    pub subscriptions: Subscriptions,
}

pub struct DhtAddressProvider {
    config: DhtConfig,
    sink: Option<mpsc::Sender<AddressEvent>>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl DhtAddressProvider {
    pub fn new(config: DhtConfig) -> Self {
        Self {
            config,
            sink: None,
            stop_tx: None,
            task: None,
        }
    }
}

impl AddressProvider for DhtAddressProvider {
    fn register(&mut self, sink: mpsc::Sender<AddressEvent>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let dht_port = self.config.dht_port;
        let tcp_port = self.config.tcp_port;
        let bootstrap = self.config.bootstrap.clone();
        let keys: Vec<kad::RecordKey> = self
            .config
            .subscriptions
            .to_combinations()
            .iter()
            .map(|topic| kad::RecordKey::new(&topic.info_hash()))
            .collect();

        self.task = Some(tokio::spawn(async move {
            let swarm = match build_swarm(tcp_port) {
                Ok(swarm) => swarm,
                Err(e) => {
                    let _ = sink.send(AddressEvent::IoError(format!("DHT: {e}"))).await;
                    return;
                }
            };
            run_swarm(swarm, dht_port, tcp_port, bootstrap, keys, sink, stop_rx).await;
        }));
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn send_all(sink: &mpsc::Sender<AddressEvent>, addrs: Vec<String>) -> bool {
    for addr in addrs {
        debug!(addr = %addr, "DHT peer address");
        if sink.send(AddressEvent::Address(addr)).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_swarm(
    mut swarm: Swarm<DhtBehaviour>,
    dht_port: u16,
    tcp_port: u16,
    bootstrap: Vec<String>,
    keys: Vec<kad::RecordKey>,
    sink: mpsc::Sender<AddressEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let listen: Multiaddr = match format!("/ip4/0.0.0.0/udp/{dht_port}/quic-v1").parse() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = sink.send(AddressEvent::IoError(format!("DHT listen address: {e}"))).await;
            return;
        }
    };
    if let Err(e) = swarm.listen_on(listen) {
        let _ = sink.send(AddressEvent::IoError(format!("DHT listen: {e}"))).await;
        return;
    }

    for raw in &bootstrap {
        match raw.parse::<Multiaddr>() {
            Ok(addr) => {
                if let Some(peer_id) = peer_id_of(&addr) {
                    swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                }
                if let Err(e) = swarm.dial(addr.clone()) {
                    warn!(addr = %addr, error = %e, "failed to dial DHT bootstrap node");
                }
            }
            Err(e) => {
                let _ = sink
                    .send(AddressEvent::ParseError {
                        input: raw.clone(),
                        reason: e.to_string(),
                    })
                    .await;
            }
        }
    }
    if !bootstrap.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    let mut state = DhtState::new(tcp_port);
    let mut ticker = tokio::time::interval(ADDRESS_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for key in &keys {
                    let kademlia = &mut swarm.behaviour_mut().kademlia;
                    if let Err(e) = kademlia.start_providing(key.clone()) {
                        debug!(error = %e, "start_providing failed");
                    }
                    kademlia.get_providers(key.clone());
                }
            }

            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(DhtEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                    result: kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders { providers, .. })),
                    ..
                })) => {
                    let local = *swarm.local_peer_id();
                    let mut found = Vec::new();
                    for peer in providers {
                        if peer == local {
                            continue;
                        }
                        let addrs = state.addresses_for(&peer);
                        if addrs.is_empty() {
                            state.wanted.insert(peer);
                            if let Err(e) = swarm.dial(peer) {
                                debug!(peer = %peer, error = %e, "dial DHT provider failed");
                            }
                        } else {
                            found.extend(addrs);
                        }
                    }
                    if !send_all(&sink, found).await {
                        break;
                    }
                }

                SwarmEvent::Behaviour(DhtEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                    for addr in &info.listen_addrs {
                        swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                        if let Some(ip) = ip_of(addr) {
                            state.add_ip(peer_id, ip);
                        }
                    }
                    state.remotes.entry(peer_id).or_default().tcp_port =
                        tcp_port_from_agent(&info.agent_version);
                    if state.wanted.remove(&peer_id) && !send_all(&sink, state.addresses_for(&peer_id)).await {
                        break;
                    }
                }

                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    if let Some(ip) = ip_of(endpoint.get_remote_address()) {
                        state.add_ip(peer_id, ip);
                    }
                }

                SwarmEvent::NewListenAddr { address, .. } => {
                    info!(addr = %address, "DHT listening");
                    if let Some(ip) = ip_of(&address) {
                        state.local_ips.insert(ip);
                    }
                }

                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    debug!(peer = ?peer_id, error = %error, "DHT outgoing connection error");
                }

                _ => {}
            },

            _ = stop_rx.changed() => break,
        }
    }

    info!("DHT address provider stopped");
}
