use thiserror::Error;

use dscuss_shared::{EntityError, PacketError};
use dscuss_store::StoreError;

/// Errors produced by the networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// The remote broke the protocol; the peer is terminated.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Packet size exceeded: {size} > {max} bytes")]
    PacketSizeExceeded { size: usize, max: usize },

    #[error("Wrong packet type: expected {expected}, got {actual}")]
    WrongPacketType { expected: String, actual: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A read or write deadline expired.
    #[error("Timed out")]
    Timeout,

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl NetError {
    /// Whether the error came from the remote breaking the protocol, as
    /// opposed to local trouble or an ordinary disconnect.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            NetError::ProtocolViolation(_)
                | NetError::PacketSizeExceeded { .. }
                | NetError::WrongPacketType { .. }
                | NetError::MalformedPayload(_)
        )
    }
}

impl From<PacketError> for NetError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::WrongPacketType { expected, actual } => {
                NetError::WrongPacketType { expected, actual }
            }
            PacketError::MalformedPayload(s) => NetError::MalformedPayload(s),
            other => NetError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<EntityError> for NetError {
    fn from(e: EntityError) -> Self {
        NetError::ProtocolViolation(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
