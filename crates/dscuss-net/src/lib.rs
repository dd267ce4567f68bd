//! Peer-to-peer transport for dscuss nodes: address discovery, TCP
//! connection management, packet framing and the per-peer sync protocol.

pub mod address;
pub mod codec;
pub mod connection;
pub mod dht;
pub mod dns;
pub mod peer;
pub mod pool;
pub mod provider;

mod error;

pub use address::{AddressEvent, AddressProvider, FileAddressProvider, StaticAddressProvider};
pub use codec::PacketCodec;
pub use connection::{Connection, Direction};
pub use dht::{DhtAddressProvider, DhtConfig};
pub use dns::DnsAddressProvider;
pub use error::{NetError, Result};
pub use peer::{PeerContext, PeerInfo, PeerState, SyncLimits};
pub use pool::PeerPool;
pub use provider::{ConnectionProvider, ProviderConfig};
