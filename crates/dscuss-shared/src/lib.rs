//! # dscuss-shared
//!
//! Types shared by every dscuss crate: identifiers, P-224 keys and the
//! scrypt proof of work, the three signed entity kinds, topics and
//! subscriptions, reply trees and the wire packet format.

pub mod constants;
pub mod crypto;
pub mod entity;
pub mod error;
pub mod packet;
pub mod pow;
pub mod subs;
pub mod thread;
pub mod types;

pub use crypto::{PrivateKey, PublicKey, Signature};
pub use entity::{Entity, EntityKind, Message, Operation, OperationType, Reason, User};
pub use error::{CryptoError, EntityError, PacketError, SubsError};
pub use packet::{Hello, Packet, PacketType};
pub use subs::{Subscriptions, Topic};
pub use thread::{Node, NodeRef, Thread, Visit};
pub use types::Id;
