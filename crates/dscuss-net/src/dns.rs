//! DNS seed address provider.
//!
//! Resolves the seed name's A records over DNS-over-HTTPS (Cloudflare and
//! Google) and emits `ip:port` for each.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use dscuss_shared::constants::{ADDRESS_REFRESH_INTERVAL, DOH_CLOUDFLARE, DOH_GOOGLE};

use crate::address::{AddressEvent, AddressProvider};

pub fn build_doh_resolver() -> TokioAsyncResolver {
    let cloudflare_addr: IpAddr = DOH_CLOUDFLARE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    let google_addr: IpAddr = DOH_GOOGLE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));

    let mut config = ResolverConfig::new();
    for (addr, name) in [
        (cloudflare_addr, "cloudflare-dns.com"),
        (google_addr, "dns.google"),
    ] {
        config.add_name_server(NameServerConfig {
            socket_addr: SocketAddr::new(addr, 443),
            protocol: Protocol::Https,
            tls_dns_name: Some(name.to_string()),
            trust_negative_responses: false,
            tls_config: None,
            bind_addr: None,
        });
    }

    let mut opts = ResolverOpts::default();
    opts.num_concurrent_reqs = 2;
    opts.rotate = true;

    TokioAsyncResolver::tokio(config, opts)
}

pub struct DnsAddressProvider {
    seed: String,
    port: u16,
    sink: Option<mpsc::Sender<AddressEvent>>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl DnsAddressProvider {
    pub fn new(seed: &str, port: u16) -> Self {
        Self {
            seed: seed.to_string(),
            port,
            sink: None,
            stop_tx: None,
            task: None,
        }
    }
}

async fn resolve_once(
    resolver: &TokioAsyncResolver,
    seed: &str,
    port: u16,
) -> Vec<AddressEvent> {
    match resolver.ipv4_lookup(seed).await {
        Ok(lookup) => lookup
            .iter()
            .map(|a| AddressEvent::Address(SocketAddr::new(IpAddr::V4(a.0), port).to_string()))
            .collect(),
        Err(e) => vec![AddressEvent::IoError(format!("resolving {seed}: {e}"))],
    }
}

impl AddressProvider for DnsAddressProvider {
    fn register(&mut self, sink: mpsc::Sender<AddressEvent>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let seed = self.seed.clone();
        let port = self.port;
        self.task = Some(tokio::spawn(async move {
            let resolver = build_doh_resolver();
            let mut ticker = tokio::time::interval(ADDRESS_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let events = resolve_once(&resolver, &seed, port).await;
                        tracing::debug!(seed = %seed, count = events.len(), "dns seed resolved");
                        for event in events {
                            if sink.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!("dns address provider stopped");
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
